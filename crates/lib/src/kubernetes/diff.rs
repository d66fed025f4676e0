//! Manifest-level diffs.
//!
//! [`diff_list`] pairs two manifest lists by key (namespace ignored) and
//! diffs each pair; [`DiffListResult::render`] turns the outcome into the
//! text shown in drift reports and by `piped diff`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};
use thiserror::Error;

use super::manifest::{Manifest, ManifestError};
use crate::diff::{DiffOptions, DiffResult, Renderer, diff_values};
use crate::util::process::run_tool;

const DIFF_COMMAND: &str = "diff";

#[derive(Debug, Error)]
pub enum DiffError {
  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error("failed to write temporary file: {0}")]
  TempFile(std::io::Error),

  #[error("failed to run diff: {0}")]
  Command(String),
}

/// Diff `old` against `new`.
///
/// Secret values the new side keeps in `stringData` are moved out of the old
/// side's base64 `data` first so equal values do not show as changes.
pub fn diff(old: &Manifest, new: &Manifest, opts: &DiffOptions) -> DiffResult {
  let mut opts = opts.clone();
  opts.compare_quantities = true;

  if old.key.is_secret() && new.key.is_secret() {
    let normalized = normalize_secret(old.object(), new.object());
    return diff_values(&Value::Object(normalized), &new.to_value(), &opts);
  }
  diff_values(&old.to_value(), &new.to_value(), &opts)
}

fn normalize_secret(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
  let mut old = old.clone();
  let Some(new_string_data) = new.get("stringData").and_then(Value::as_object) else {
    return old;
  };

  let mut moved = Vec::new();
  if let Some(data) = old.get("data").and_then(Value::as_object) {
    let existing = old.get("stringData").and_then(Value::as_object);
    for (key, value) in data {
      if existing.is_some_and(|s| s.contains_key(key)) || !new_string_data.contains_key(key) {
        continue;
      }
      let decoded = value
        .as_str()
        .and_then(|v| STANDARD.decode(v).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());
      if let Some(decoded) = decoded {
        moved.push((key.clone(), decoded));
      }
    }
  }

  for (key, decoded) in moved {
    if let Some(Value::Object(data)) = old.get_mut("data") {
      data.remove(&key);
    }
    let string_data = old
      .entry("stringData")
      .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(string_data) = string_data {
      string_data.insert(key, Value::String(decoded));
    }
  }
  if old.get("data").and_then(Value::as_object).is_some_and(Map::is_empty) {
    old.remove("data");
  }
  old
}

#[derive(Debug, Clone)]
pub struct DiffListChange {
  pub old: Manifest,
  pub new: Manifest,
  pub diff: DiffResult,
}

#[derive(Debug, Clone, Default)]
pub struct DiffListResult {
  pub adds: Vec<Manifest>,
  pub deletes: Vec<Manifest>,
  pub changes: Vec<DiffListChange>,
}

impl DiffListResult {
  pub fn no_change(&self) -> bool {
    self.adds.is_empty() && self.deletes.is_empty() && self.changes.is_empty()
  }

  pub fn total_count(&self) -> usize {
    self.adds.len() + self.deletes.len() + self.changes.len()
  }
}

/// Diff two manifest lists.
///
/// `ignored_paths` maps a key's string form to dotted paths excluded for that
/// manifest.
pub fn diff_list(
  olds: &[Manifest],
  news: &[Manifest],
  ignored_paths: &HashMap<String, Vec<String>>,
  opts: &DiffOptions,
) -> DiffListResult {
  let (adds, deletes, pairs) = group_manifests(olds, news);
  let mut result = DiffListResult {
    adds,
    deletes,
    changes: Vec::with_capacity(pairs.len()),
  };

  for (old, new) in pairs {
    let mut opts = opts.clone();
    opts.ignored_paths = ignored_paths.get(&old.key.to_string()).cloned().unwrap_or_default();
    let diff = diff(&old, &new, &opts);
    if diff.has_diff() {
      result.changes.push(DiffListChange { old, new, diff });
    }
  }
  result
}

type Pairs = Vec<(Manifest, Manifest)>;

fn group_manifests(olds: &[Manifest], news: &[Manifest]) -> (Vec<Manifest>, Vec<Manifest>, Pairs) {
  let mut olds = olds.to_vec();
  let mut news = news.to_vec();
  olds.sort_by(|a, b| a.key.cmp_ignoring_namespace(&b.key));
  news.sort_by(|a, b| a.key.cmp_ignoring_namespace(&b.key));

  let (mut adds, mut deletes, mut pairs) = (Vec::new(), Vec::new(), Vec::new());
  let mut olds = olds.into_iter().peekable();
  let mut news = news.into_iter().peekable();
  loop {
    let ordering = match (olds.peek(), news.peek()) {
      (Some(o), Some(n)) => n.key.cmp_ignoring_namespace(&o.key),
      _ => break,
    };
    match ordering {
      std::cmp::Ordering::Equal => {
        if let (Some(o), Some(n)) = (olds.next(), news.next()) {
          pairs.push((o, n));
        }
      }
      std::cmp::Ordering::Less => adds.extend(news.next()),
      std::cmp::Ordering::Greater => deletes.extend(olds.next()),
    }
  }
  adds.extend(news);
  deletes.extend(olds);
  (adds, deletes, pairs)
}

#[derive(Debug, Clone, Default)]
pub struct DiffRenderOptions {
  pub mask_secret: bool,
  pub mask_config_map: bool,
  /// Zero renders every change.
  pub max_changed_manifests: usize,
  /// Render through the `diff` command rather than the built-in renderer.
  pub use_diff_command: bool,
}

impl DiffListResult {
  pub async fn render(&self, opts: &DiffRenderOptions) -> String {
    let mut out = String::new();
    let mut index = 0;
    for delete in &self.deletes {
      index += 1;
      out.push_str(&format!("- {}. {}\n\n", index, delete.key.readable_string()));
    }
    for add in &self.adds {
      index += 1;
      out.push_str(&format!("+ {}. {}\n\n", index, add.key.readable_string()));
    }

    let max = match opts.max_changed_manifests {
      0 => self.changes.len(),
      n => n.min(self.changes.len()),
    };
    for change in self.changes.iter().take(max) {
      let key = &change.old.key;
      let mut renderer = Renderer::new().with_left_padding(1);
      let mut masked = false;
      if (opts.mask_secret && key.is_secret()) || (opts.mask_config_map && key.is_config_map()) {
        renderer = renderer.with_mask_path("data");
        masked = true;
      }

      index += 1;
      out.push_str(&format!("# {}. {}\n\n", index, key.readable_string()));
      if !opts.use_diff_command || masked {
        out.push_str(&renderer.render(change.diff.nodes()));
      } else {
        match diff_by_command(DIFF_COMMAND, &change.old, &change.new).await {
          Ok(text) => out.push_str(&text),
          Err(err) => out.push_str(&format!("An error occurred while rendering diff ({})", err)),
        }
      }
      out.push('\n');
    }

    if max < self.changes.len() {
      out.push_str(&format!(
        "... (omitted {} other changed manifests)\n",
        self.changes.len() - max
      ));
    }
    out
  }
}

/// Unified diff of the two manifests' YAML with the file header removed.
pub async fn diff_by_command(command: &str, old: &Manifest, new: &Manifest) -> Result<String, DiffError> {
  let dir = tempfile::tempdir().map_err(DiffError::TempFile)?;
  let old_path = dir.path().join("old");
  let new_path = dir.path().join("new");
  tokio::fs::write(&old_path, old.to_yaml()?)
    .await
    .map_err(DiffError::TempFile)?;
  tokio::fs::write(&new_path, new.to_yaml()?)
    .await
    .map_err(DiffError::TempFile)?;

  let args = [
    OsStr::new("-u"),
    OsStr::new("-N"),
    old_path.as_os_str(),
    new_path.as_os_str(),
  ];
  let out = run_tool(Path::new(command), args, None, None)
    .await
    .map_err(|e| DiffError::Command(e.to_string()))?;
  // diff exits non-zero when the inputs differ.
  if out.stdout.is_empty() && !out.success {
    return Err(DiffError::Command(out.stderr));
  }

  let data = out.stdout.trim();
  let mut rows = data.splitn(3, '\n');
  match (rows.next(), rows.next(), rows.next()) {
    (Some(_), Some(_), Some(rest)) => Ok(rest.to_string()),
    _ => Ok(data.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kubernetes::manifest::parse_manifests;

  fn manifests(yaml: &str) -> Vec<Manifest> {
    parse_manifests(yaml).unwrap()
  }

  const HEAD: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: a\nspec:\n  type: ClusterIP\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: a\nspec:\n  replicas: 2\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: v\n";

  #[test]
  fn groups_by_key_ignoring_namespace() {
    let head = manifests(HEAD);
    let live = manifests(
      "apiVersion: v1\nkind: Service\nmetadata:\n  name: a\n  namespace: other\nspec:\n  type: ClusterIP\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: a\nspec:\n  replicas: 3\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: gone\n",
    );

    let result = diff_list(&live, &head, &HashMap::new(), &DiffOptions::default());
    assert_eq!(result.adds.len(), 1);
    assert_eq!(result.adds[0].key.kind, "ConfigMap");
    assert_eq!(result.deletes.len(), 1);
    assert_eq!(result.deletes[0].key.name, "gone");
    assert_eq!(result.changes.len(), 1);
    assert_eq!(result.changes[0].new.key.kind, "Deployment");
    assert_eq!(result.total_count(), 3);
    assert!(!result.no_change());
  }

  #[test]
  fn identical_lists_have_no_change() {
    let head = manifests(HEAD);
    let result = diff_list(&head, &head, &HashMap::new(), &DiffOptions::default());
    assert!(result.no_change());
  }

  #[test]
  fn ignored_paths_apply_per_key() {
    let head = manifests(HEAD);
    let mut live = manifests(HEAD);
    live[1].set_replicas(5).unwrap();

    let mut ignored = HashMap::new();
    ignored.insert(live[1].key.to_string(), vec!["spec.replicas".to_string()]);
    assert!(diff_list(&live, &head, &ignored, &DiffOptions::default()).no_change());
  }

  #[test]
  fn secret_string_data_matches_base64_data() {
    let live = manifests("apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\ndata:\n  password: c2VjcmV0\n");
    let head = manifests("apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\nstringData:\n  password: secret\n");
    assert!(!diff(&live[0], &head[0], &DiffOptions::default()).has_diff());

    let changed = manifests("apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\nstringData:\n  password: other\n");
    assert!(diff(&live[0], &changed[0], &DiffOptions::default()).has_diff());
  }

  #[test]
  fn quantities_are_normalized() {
    let live = manifests("apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\nspec:\n  resources:\n    memory: 2048Mi\n");
    let head = manifests("apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\nspec:\n  resources:\n    memory: 2Gi\n");
    assert!(!diff(&live[0], &head[0], &DiffOptions::default()).has_diff());
  }

  #[tokio::test]
  async fn render_masks_and_caps_changes() {
    let live = manifests(
      "apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\ndata:\n  password: c2VjcmV0\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: a\nspec:\n  replicas: 1\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: b\nspec:\n  replicas: 1\n",
    );
    let head = manifests(
      "apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\ndata:\n  password: b3RoZXI=\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: a\nspec:\n  replicas: 2\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: b\nspec:\n  replicas: 2\n",
    );
    let result = diff_list(&live, &head, &HashMap::new(), &DiffOptions::default());
    assert_eq!(result.changes.len(), 3);

    let text = result
      .render(&DiffRenderOptions {
        mask_secret: true,
        max_changed_manifests: 2,
        ..Default::default()
      })
      .await;
    assert!(text.contains("# 1. name=\"a\", kind=\"Deployment\""));
    assert!(text.contains("... (omitted 1 other changed manifests)"));
    assert!(!text.contains("c2VjcmV0"));
  }
}
