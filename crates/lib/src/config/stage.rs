use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{K8sResourceReference, duration_secs};

/// Every stage the executors know how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
  K8sSync,
  K8sPrimaryRollout,
  K8sCanaryRollout,
  K8sCanaryClean,
  K8sBaselineRollout,
  K8sBaselineClean,
  K8sTrafficRouting,
  LambdaSync,
  LambdaPromote,
  LambdaCanaryRollout,
  ScriptRun,
  Rollback,
  ScriptRunRollback,
}

impl StageName {
  pub fn as_str(&self) -> &'static str {
    match self {
      StageName::K8sSync => "K8sSync",
      StageName::K8sPrimaryRollout => "K8sPrimaryRollout",
      StageName::K8sCanaryRollout => "K8sCanaryRollout",
      StageName::K8sCanaryClean => "K8sCanaryClean",
      StageName::K8sBaselineRollout => "K8sBaselineRollout",
      StageName::K8sBaselineClean => "K8sBaselineClean",
      StageName::K8sTrafficRouting => "K8sTrafficRouting",
      StageName::LambdaSync => "LambdaSync",
      StageName::LambdaPromote => "LambdaPromote",
      StageName::LambdaCanaryRollout => "LambdaCanaryRollout",
      StageName::ScriptRun => "ScriptRun",
      StageName::Rollback => "Rollback",
      StageName::ScriptRunRollback => "ScriptRunRollback",
    }
  }
}

impl fmt::Display for StageName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A pod count, either absolute or a percentage of the primary's replicas.
///
/// Written as `3` or `"50%"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Replicas {
  #[default]
  Unset,
  Number(i32),
  Percentage(i32),
}

impl Replicas {
  /// Resolve against the current replica count; `default` when unset.
  ///
  /// Percentages round up.
  pub fn calculate(&self, total: i32, default: i32) -> i32 {
    match *self {
      Replicas::Unset => default,
      Replicas::Number(n) => n,
      Replicas::Percentage(p) => {
        let value = (p as i64) * (total as i64);
        ((value + 99) / 100) as i32
      }
    }
  }
}

impl Serialize for Replicas {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    match self {
      Replicas::Unset => s.serialize_none(),
      Replicas::Number(n) => s.serialize_i32(*n),
      Replicas::Percentage(p) => s.serialize_str(&format!("{}%", p)),
    }
  }
}

impl<'de> Deserialize<'de> for Replicas {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    match NumberOrString::deserialize(d)? {
      NumberOrString::Number(n) => Ok(Replicas::Number(n)),
      NumberOrString::Text(text) => {
        let (number, is_percentage) = parse_percent_text(&text).map_err(serde::de::Error::custom)?;
        Ok(if is_percentage {
          Replicas::Percentage(number)
        } else {
          Replicas::Number(number)
        })
      }
    }
  }
}

/// A traffic percentage, written as `30` or `"30%"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Percentage(pub i32);

impl Percentage {
  pub fn int(&self) -> i32 {
    self.0
  }
}

impl Serialize for Percentage {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i32(self.0)
  }
}

impl<'de> Deserialize<'de> for Percentage {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let value = match NumberOrString::deserialize(d)? {
      NumberOrString::Number(n) => n,
      NumberOrString::Text(text) => parse_percent_text(&text).map_err(serde::de::Error::custom)?.0,
    };
    if !(0..=100).contains(&value) {
      return Err(serde::de::Error::custom(format!(
        "percentage must be between 0 and 100, got {}",
        value
      )));
    }
    Ok(Percentage(value))
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
  Number(i32),
  Text(String),
}

fn parse_percent_text(text: &str) -> Result<(i32, bool), String> {
  let trimmed = text.trim();
  let (digits, is_percentage) = match trimmed.strip_suffix('%') {
    Some(digits) => (digits, true),
    None => (trimmed, false),
  };
  let number = digits
    .trim()
    .parse::<i32>()
    .map_err(|_| format!("invalid number: {}", text))?;
  Ok((number, is_percentage))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sSyncStageOptions {
  /// Add the primary variant label to workload selectors when missing.
  pub add_variant_label_to_selector: bool,
  /// Remove resources no longer defined in Git.
  pub prune: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sPrimaryRolloutStageOptions {
  /// Suffix for generated primary resources. Defaults to the variant value.
  pub suffix: String,
  pub create_service: bool,
  pub add_variant_label_to_selector: bool,
  pub prune: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sCanaryRolloutStageOptions {
  /// Defaults to one pod.
  pub replicas: Replicas,
  pub suffix: String,
  pub create_service: bool,
  pub patches: Vec<K8sResourcePatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sBaselineRolloutStageOptions {
  pub replicas: Replicas,
  pub suffix: String,
  pub create_service: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sCleanStageOptions {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sTrafficRoutingStageOptions {
  /// Route everything to one variant: `primary`, `canary` or `baseline`.
  pub all: String,
  pub primary: Percentage,
  pub canary: Percentage,
  pub baseline: Percentage,
}

impl K8sTrafficRoutingStageOptions {
  /// Percentages for (primary, canary, baseline).
  pub fn percentages(&self) -> (i32, i32, i32) {
    match self.all.as_str() {
      "primary" => (100, 0, 0),
      "canary" => (0, 100, 0),
      "baseline" => (0, 0, 100),
      _ => (self.primary.int(), self.canary.int(), self.baseline.int()),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sResourcePatch {
  pub target: K8sResourcePatchTarget,
  pub ops: Vec<K8sResourcePatchOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sResourcePatchTarget {
  #[serde(flatten)]
  pub reference: K8sResourceReference,
  /// Field whose string value is the document to patch. Empty patches the
  /// whole manifest.
  pub document_root: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum K8sResourcePatchOpName {
  #[default]
  #[serde(rename = "yaml-replace")]
  YamlReplace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sResourcePatchOp {
  pub op: K8sResourcePatchOpName,
  /// Dotted path of the field to replace, e.g. `$.spec.replicas`.
  pub path: String,
  /// YAML text of the new value.
  pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaSyncStageOptions {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaCanaryRolloutStageOptions {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaPromoteStageOptions {
  /// Share of traffic routed to the newly published version.
  pub percent: Percentage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptRunStageOptions {
  pub run: String,
  pub env: BTreeMap<String, String>,
  pub on_rollback: String,
  #[serde(with = "duration_secs")]
  pub timeout: std::time::Duration,
}
