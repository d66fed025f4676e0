//! Manifests command implementation.
//!
//! Renders a Kubernetes application the way deployments load it (plain
//! YAML, kustomize or helm) and prints the result in apply order.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::debug;

use piped_lib::config::load_application_config;
use piped_lib::kubernetes::{Loader, LoaderInput};
use piped_lib::toolregistry::Registry;

use crate::output::{OutputFormat, format_duration, print_json};

pub fn cmd_manifests(
  app_dir: &Path,
  config_filename: &str,
  repo_dir: Option<&Path>,
  tools_dir: &Path,
  output: OutputFormat,
) -> Result<()> {
  let app_dir = dunce::canonicalize(app_dir).with_context(|| format!("Application directory {} not found", app_dir.display()))?;
  let spec = load_application_config(&app_dir, config_filename)
    .and_then(|cfg| cfg.kubernetes_spec())
    .context("Failed to load application config")?;
  let registry = Arc::new(Registry::new(tools_dir).context("Failed to initialize tool registry")?);

  let input = LoaderInput {
    app_name: spec.generic.name.clone(),
    repo_dir: repo_dir.map(Path::to_path_buf).unwrap_or_else(|| app_dir.clone()),
    app_dir,
    config_filename: config_filename.to_string(),
    input: spec.input,
  };
  let loader = Loader::new(input, registry);
  debug!(method = ?loader.templating_method(), "loading manifests");

  let started = Instant::now();
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let manifests = rt.block_on(loader.load_manifests()).context("Failed to load manifests")?;
  debug!(count = manifests.len(), elapsed = %format_duration(started.elapsed()), "loaded manifests");

  if output.is_json() {
    let objects: Vec<serde_json::Value> = manifests.iter().map(|m| m.to_value()).collect();
    return print_json(&objects);
  }

  for manifest in &manifests {
    let yaml = manifest
      .to_yaml()
      .with_context(|| format!("Failed to encode {}", manifest.key))?;
    println!("---");
    print!("{}", yaml);
  }
  Ok(())
}
