//! Structural diff of JSON-like object trees.
//!
//! [`diff_values`] walks two trees in lockstep and records every leaf or
//! subtree that differs as a [`DiffNode`]. Options relax the comparison for
//! objects that round-tripped through a server.

mod render;

pub use render::Renderer;

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathStep {
  Key(String),
  Index(usize),
}

impl fmt::Display for PathStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PathStep::Key(key) => f.write_str(key),
      PathStep::Index(index) => write!(f, "{}", index),
    }
  }
}

/// Dotted form of a path, e.g. `spec.template.spec.containers.0.image`.
pub fn path_string(path: &[PathStep]) -> String {
  path.iter().map(PathStep::to_string).collect::<Vec<_>>().join(".")
}

/// One differing position. `None` marks a side where the field is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffNode {
  pub path: Vec<PathStep>,
  pub old: Option<Value>,
  pub new: Option<Value>,
}

impl DiffNode {
  pub fn path_string(&self) -> String {
    path_string(&self.path)
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResult {
  nodes: Vec<DiffNode>,
}

impl DiffResult {
  pub fn has_diff(&self) -> bool {
    !self.nodes.is_empty()
  }

  pub fn nodes(&self) -> &[DiffNode] {
    &self.nodes
  }

  pub fn num_nodes(&self) -> usize {
    self.nodes.len()
  }

  /// Nodes whose dotted path starts with `prefix`.
  pub fn find_by_prefix(&self, prefix: &str) -> Vec<&DiffNode> {
    self.nodes.iter().filter(|n| n.path_string().starts_with(prefix)).collect()
  }
}

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
  /// Keys present only on the old (left) side are not differences; keys
  /// only the new (right) side has are still reported.
  ///
  /// Callers pass the live state as old and git as new, so this drops the
  /// fields controllers inject into live objects. It is the mirror of
  /// skipping keys the left side lacks: with `diff(live, git)` that would
  /// hide fields git declares but the cluster never received. Drift
  /// detection for Lambda copies head-only fields into the live manifest
  /// for the same reason, since the API does not return them.
  pub ignore_adding_map_keys: bool,
  /// Absent, null, zero values and empty collections compare equal.
  pub equate_empty: bool,
  /// `1.5` equals `"1.5"`.
  pub compare_number_and_numeric_string: bool,
  /// `2Gi` equals `2048Mi`, `0.5` equals `500m`.
  pub compare_quantities: bool,
  /// Dotted path prefixes excluded from comparison.
  pub ignored_paths: Vec<String>,
}

impl DiffOptions {
  pub fn with_ignore_adding_map_keys(mut self) -> Self {
    self.ignore_adding_map_keys = true;
    self
  }

  pub fn with_equate_empty(mut self) -> Self {
    self.equate_empty = true;
    self
  }

  pub fn with_compare_number_and_numeric_string(mut self) -> Self {
    self.compare_number_and_numeric_string = true;
    self
  }

  pub fn with_compare_quantities(mut self) -> Self {
    self.compare_quantities = true;
    self
  }

  pub fn with_ignored_paths(mut self, paths: Vec<String>) -> Self {
    self.ignored_paths = paths;
    self
  }
}

/// Diff `x` (old) against `y` (new).
pub fn diff_values(x: &Value, y: &Value, opts: &DiffOptions) -> DiffResult {
  let mut differ = Differ { opts, nodes: Vec::new() };
  let mut path = Vec::new();
  differ.diff(&mut path, Some(x), Some(y));
  differ.nodes.sort_by(|a, b| a.path.cmp(&b.path));
  DiffResult { nodes: differ.nodes }
}

struct Differ<'a> {
  opts: &'a DiffOptions,
  nodes: Vec<DiffNode>,
}

impl Differ<'_> {
  fn add(&mut self, path: &[PathStep], x: Option<&Value>, y: Option<&Value>) {
    self.nodes.push(DiffNode {
      path: path.to_vec(),
      old: x.cloned(),
      new: y.cloned(),
    });
  }

  fn is_ignored(&self, path: &[PathStep]) -> bool {
    if self.opts.ignored_paths.is_empty() || path.is_empty() {
      return false;
    }
    let path = path_string(path);
    self.opts.ignored_paths.iter().any(|p| !p.is_empty() && path.starts_with(p.as_str()))
  }

  fn diff(&mut self, path: &mut Vec<PathStep>, x: Option<&Value>, y: Option<&Value>) {
    if self.is_ignored(path) {
      return;
    }

    let (x, y) = match (x, y) {
      (None, None) => return,
      (None, Some(y)) => {
        if !(self.opts.equate_empty && is_empty(y)) {
          self.add(path, None, Some(y));
        }
        return;
      }
      (Some(x), None) => {
        if !(self.opts.equate_empty && is_empty(x)) {
          self.add(path, Some(x), None);
        }
        return;
      }
      (Some(x), Some(y)) => (x, y),
    };

    if self.opts.equate_empty && is_empty(x) && is_empty(y) {
      return;
    }

    match (x, y) {
      (Value::Number(a), Value::Number(b)) => {
        if a.as_f64() != b.as_f64() {
          self.add(path, Some(x), Some(y));
        }
      }
      (Value::Object(a), Value::Object(b)) => {
        let mut keys: Vec<&String> = b.keys().collect();
        if !self.opts.ignore_adding_map_keys {
          keys.extend(a.keys().filter(|k| !b.contains_key(*k)));
        }
        keys.sort();
        for key in keys {
          path.push(PathStep::Key(key.clone()));
          self.diff(path, a.get(key), b.get(key));
          path.pop();
        }
      }
      (Value::Array(a), Value::Array(b)) => {
        let common = a.len().min(b.len());
        for i in 0..a.len().max(b.len()) {
          path.push(PathStep::Index(i));
          if i < common {
            self.diff(path, Some(&a[i]), Some(&b[i]));
          } else if !self.is_ignored(path) {
            self.add(path, a.get(i), b.get(i));
          }
          path.pop();
        }
      }
      (Value::String(a), Value::String(b)) => {
        if a != b && !(self.opts.compare_quantities && quantities_equal(a, b)) {
          self.add(path, Some(x), Some(y));
        }
      }
      (Value::Bool(a), Value::Bool(b)) => {
        if a != b {
          self.add(path, Some(x), Some(y));
        }
      }
      (Value::Null, Value::Null) => {}
      _ => {
        if !self.loosely_equal(x, y) {
          self.add(path, Some(x), Some(y));
        }
      }
    }
  }

  /// Number against string comparisons enabled by the options.
  fn loosely_equal(&self, x: &Value, y: &Value) -> bool {
    let (number, text) = match (x, y) {
      (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => (n, s),
      _ => return false,
    };
    let Some(number) = number.as_f64() else {
      return false;
    };
    if self.opts.compare_number_and_numeric_string {
      if let Ok(parsed) = text.trim().parse::<f64>() {
        return parsed == number;
      }
    }
    if self.opts.compare_quantities {
      if let Some(parsed) = parse_quantity(text) {
        return approx_eq(parsed, number);
      }
    }
    false
  }
}

/// Null, zero scalars and empty collections.
fn is_empty(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::Bool(b) => !b,
    Value::Number(n) => n.as_f64() == Some(0.0),
    Value::String(s) => s.is_empty(),
    Value::Array(a) => a.is_empty(),
    Value::Object(o) => o.is_empty(),
  }
}

fn quantities_equal(a: &str, b: &str) -> bool {
  match (parse_quantity(a), parse_quantity(b)) {
    (Some(a), Some(b)) => approx_eq(a, b),
    _ => false,
  }
}

fn approx_eq(a: f64, b: f64) -> bool {
  let scale = a.abs().max(b.abs()).max(1.0);
  ((a - b) / scale).abs() < 1e-12
}

const BINARY_SUFFIXES: &[(&str, f64)] = &[
  ("Ki", 1024.0),
  ("Mi", 1048576.0),
  ("Gi", 1073741824.0),
  ("Ti", 1099511627776.0),
  ("Pi", 1125899906842624.0),
  ("Ei", 1152921504606846976.0),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
  ("n", 1e-9),
  ("u", 1e-6),
  ("m", 1e-3),
  ("k", 1e3),
  ("M", 1e6),
  ("G", 1e9),
  ("T", 1e12),
  ("P", 1e15),
  ("E", 1e18),
];

/// Value of a Kubernetes resource quantity such as `500m`, `2Gi` or `1e3`.
pub fn parse_quantity(text: &str) -> Option<f64> {
  let text = text.trim();
  if text.is_empty() {
    return None;
  }
  for (suffix, multiplier) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES) {
    if let Some(number) = text.strip_suffix(suffix) {
      return parse_plain_number(number).map(|n| n * multiplier);
    }
  }
  parse_plain_number(text)
}

fn parse_plain_number(text: &str) -> Option<f64> {
  let valid = !text.is_empty()
    && text
      .chars()
      .all(|c| c.is_ascii_digit() || matches!(c, '.' | '+' | '-' | 'e' | 'E'))
    && text.chars().any(|c| c.is_ascii_digit());
  if !valid {
    return None;
  }
  text.parse::<f64>().ok()
}
