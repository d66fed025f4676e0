//! Diff command implementation.
//!
//! Compares two sets of Kubernetes manifests and prints added, deleted and
//! changed resources.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};

use piped_lib::diff::DiffOptions;
use piped_lib::kubernetes::loader::load_plain_yaml_manifests;
use piped_lib::kubernetes::manifest::parse_manifests;
use piped_lib::kubernetes::{DiffListResult, DiffRenderOptions, Manifest, diff_list};

use crate::output::{OutputFormat, print_json, print_success};

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffFlags {
  pub mask_secret: bool,
  pub mask_config_map: bool,
  pub use_diff_command: bool,
}

pub fn cmd_diff(old: &Path, new: &Path, flags: DiffFlags, output: OutputFormat) -> Result<()> {
  let olds = load(old)?;
  let news = load(new)?;

  let opts = DiffOptions::default().with_equate_empty();
  let result = diff_list(&olds, &news, &HashMap::new(), &opts);

  if output.is_json() {
    return print_json(&diff_json(&result));
  }

  if result.no_change() {
    print_success("No changes.");
    return Ok(());
  }

  let render = DiffRenderOptions {
    mask_secret: flags.mask_secret,
    mask_config_map: flags.mask_config_map,
    max_changed_manifests: 0,
    use_diff_command: flags.use_diff_command,
  };
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let text = rt.block_on(result.render(&render));

  println!(
    "{} added, {} deleted, {} changed",
    result.adds.len().if_supports_color(Stream::Stdout, |s| s.green()),
    result.deletes.len().if_supports_color(Stream::Stdout, |s| s.red()),
    result.changes.len().if_supports_color(Stream::Stdout, |s| s.yellow()),
  );
  println!();
  print!("{}", text);
  Ok(())
}

/// Manifests in a file, or in every YAML and JSON file directly inside a
/// directory.
pub(crate) fn load(path: &Path) -> Result<Vec<Manifest>> {
  if path.is_dir() {
    return load_plain_yaml_manifests(path, &[], "")
      .with_context(|| format!("Failed to load manifests from {}", path.display()));
  }
  let data = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
  parse_manifests(&data).with_context(|| format!("Failed to parse manifests in {}", path.display()))
}

fn diff_json(result: &DiffListResult) -> serde_json::Value {
  let keys = |manifests: &[Manifest]| -> Vec<String> { manifests.iter().map(|m| m.key.to_string()).collect() };
  let changes: Vec<_> = result
    .changes
    .iter()
    .map(|c| {
      let nodes: Vec<_> = c
        .diff
        .nodes()
        .iter()
        .map(|n| serde_json::json!({ "path": n.path_string(), "old": n.old, "new": n.new }))
        .collect();
      serde_json::json!({ "key": c.old.key.to_string(), "diffs": nodes })
    })
    .collect();
  serde_json::json!({
    "added": keys(&result.adds),
    "deleted": keys(&result.deletes),
    "changed": changes,
  })
}
