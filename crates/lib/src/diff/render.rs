use serde_json::Value;

use super::{DiffNode, PathStep};

const MASKED: &str = "*****";

/// Text form of diff nodes.
///
/// Each node prints its dotted path as a comment followed by the removed
/// (`-`) and added (`+`) values in YAML.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
  left_padding: usize,
  mask_paths: Vec<String>,
}

impl Renderer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Indent every line by `padding` levels of two spaces.
  pub fn with_left_padding(mut self, padding: usize) -> Self {
    self.left_padding = padding;
    self
  }

  /// Hide values under `prefix`, e.g. `data` of a Secret.
  pub fn with_mask_path(mut self, prefix: impl Into<String>) -> Self {
    self.mask_paths.push(prefix.into());
    self
  }

  pub fn render(&self, nodes: &[DiffNode]) -> String {
    let pad = "  ".repeat(self.left_padding);
    let mut out = String::new();
    for node in nodes {
      let path = node.path_string();
      let masked = self.mask_paths.iter().any(|p| path.starts_with(p.as_str()));

      out.push_str(&format!(" {}#{}\n", pad, path));
      if let Some(old) = &node.old {
        for line in entry_lines(&node.path, old, masked) {
          out.push_str(&format!("-{}{}\n", pad, line));
        }
      }
      if let Some(new) = &node.new {
        for line in entry_lines(&node.path, new, masked) {
          out.push_str(&format!("+{}{}\n", pad, line));
        }
      }
      out.push('\n');
    }
    out
  }
}

/// `key: value` or `- value` lines for the last step of `path`.
fn entry_lines(path: &[PathStep], value: &Value, masked: bool) -> Vec<String> {
  let body = if masked {
    MASKED.to_string()
  } else {
    to_yaml(value)
  };
  let (head, continuation) = match path.last() {
    Some(PathStep::Key(key)) => (format!("{}:", key), "  "),
    Some(PathStep::Index(_)) => ("-".to_string(), "  "),
    None => (String::new(), ""),
  };

  let is_block = !masked
    && match value {
      Value::Object(o) => !o.is_empty(),
      Value::Array(a) => !a.is_empty(),
      _ => false,
    };
  if head.is_empty() {
    return body.lines().map(str::to_string).collect();
  }
  if !is_block {
    return vec![format!("{} {}", head, body)];
  }

  let mut lines = Vec::new();
  match path.last() {
    Some(PathStep::Index(_)) => {
      // `- first: line` then the rest indented under the dash.
      let mut body_lines = body.lines();
      if let Some(first) = body_lines.next() {
        lines.push(format!("- {}", first));
      }
      lines.extend(body_lines.map(|l| format!("{}{}", continuation, l)));
    }
    _ => {
      lines.push(head);
      lines.extend(body.lines().map(|l| format!("{}{}", continuation, l)));
    }
  }
  lines
}

fn to_yaml(value: &Value) -> String {
  match serde_yaml::to_string(value) {
    Ok(text) => text.trim_end().to_string(),
    Err(_) => value.to_string(),
  }
}
