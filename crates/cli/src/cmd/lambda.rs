//! Lambda command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use piped_lib::lambda::{ArtifactKind, find_artifact_versions, parse_function_manifest};

use crate::output::{OutputFormat, print_json, print_stat, print_success, truncate_hash};

/// Parse and validate a function manifest, then list the versions of the
/// artifacts it deploys.
pub fn cmd_lambda_validate(file: &Path, output: OutputFormat) -> Result<()> {
  let data = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
  let manifest = parse_function_manifest(&data).with_context(|| format!("Invalid function manifest {}", file.display()))?;
  let versions = find_artifact_versions(&manifest).context("Unable to determine artifact versions")?;

  if output.is_json() {
    return print_json(&serde_json::json!({
      "name": manifest.spec.name,
      "versions": versions,
    }));
  }

  print_success(&format!("Function manifest for {} is valid", manifest.spec.name));
  for version in &versions {
    let (kind, shown) = match version.kind {
      ArtifactKind::ContainerImage => ("Container image", version.version.as_str()),
      ArtifactKind::S3Object => ("S3 object", version.version.as_str()),
      ArtifactKind::GitSource => ("Git source", truncate_hash(&version.version)),
    };
    let label = if version.url.is_empty() {
      shown.to_string()
    } else {
      format!("{} ({})", shown, version.url)
    };
    print_stat(kind, &label);
  }
  Ok(())
}
