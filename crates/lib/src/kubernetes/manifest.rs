//! Unstructured Kubernetes manifests.
//!
//! A [`Manifest`] pairs a [`ResourceKey`] with the object tree it was parsed
//! from. Methods that rename or move the object keep both in step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use super::resource_key::{DEFAULT_NAMESPACE, ResourceKey};
use crate::consts::ANNOTATION_RESOURCE_KEY;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read manifest file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse manifest: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("failed to encode manifest: {0}")]
  Json(#[from] serde_json::Error),

  #[error("manifest is not an object")]
  NotAnObject,

  #[error("field {path} is not {expected}")]
  FieldType { path: String, expected: &'static str },

  #[error("field {0} was not found")]
  FieldNotFound(String),

  #[error("unsupported {0}")]
  Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
  pub key: ResourceKey,
  object: Map<String, Value>,
}

impl Manifest {
  /// Build a manifest from a parsed object, deriving its key.
  pub fn from_object(object: Map<String, Value>) -> Self {
    let key = make_resource_key(&object);
    Self { key, object }
  }

  pub fn from_value(value: Value) -> Result<Self, ManifestError> {
    match value {
      Value::Object(object) => Ok(Self::from_object(object)),
      _ => Err(ManifestError::NotAnObject),
    }
  }

  /// Convert a typed object (e.g. a `k8s_openapi` struct) into a manifest.
  pub fn from_structured<T: Serialize>(object: &T) -> Result<Self, ManifestError> {
    Self::from_value(serde_json::to_value(object)?)
  }

  pub fn to_structured<T: DeserializeOwned>(&self) -> Result<T, ManifestError> {
    Ok(serde_json::from_value(Value::Object(self.object.clone()))?)
  }

  pub fn object(&self) -> &Map<String, Value> {
    &self.object
  }

  pub fn into_value(self) -> Value {
    Value::Object(self.object)
  }

  pub fn to_value(&self) -> Value {
    Value::Object(self.object.clone())
  }

  pub fn api_version(&self) -> &str {
    str_field(&self.object, "apiVersion")
  }

  pub fn kind(&self) -> &str {
    str_field(&self.object, "kind")
  }

  pub fn name(&self) -> &str {
    self.metadata_str("name")
  }

  pub fn namespace(&self) -> &str {
    self.metadata_str("namespace")
  }

  pub fn uid(&self) -> &str {
    self.metadata_str("uid")
  }

  pub fn creation_timestamp(&self) -> &str {
    self.metadata_str("creationTimestamp")
  }

  fn metadata_str(&self, field: &str) -> &str {
    self
      .object
      .get("metadata")
      .and_then(|m| m.get(field))
      .and_then(Value::as_str)
      .unwrap_or_default()
  }

  /// Deep copy under a new name.
  pub fn duplicate(&self, name: &str) -> Manifest {
    let mut copy = self.clone();
    copy.set_name(name);
    copy
  }

  pub fn set_name(&mut self, name: &str) {
    self.with_metadata(|m| {
      m.insert("name".to_string(), Value::String(name.to_string()));
    });
    self.key.name = name.to_string();
  }

  /// Set the namespace on both the tree and the key.
  pub fn set_namespace(&mut self, namespace: &str) {
    self.with_metadata(|m| {
      if namespace.is_empty() {
        m.remove("namespace");
      } else {
        m.insert("namespace".to_string(), Value::String(namespace.to_string()));
      }
    });
    self.key.namespace = namespace.to_string();
  }

  /// Set the namespace on the key only, leaving the tree untouched.
  pub fn set_key_namespace(&mut self, namespace: &str) {
    self.key.namespace = namespace.to_string();
  }

  fn with_metadata(&mut self, f: impl FnOnce(&mut Map<String, Value>)) {
    if !self.object.get("metadata").is_some_and(Value::is_object) {
      self.object.insert("metadata".to_string(), Value::Object(Map::new()));
    }
    if let Some(Value::Object(metadata)) = self.object.get_mut("metadata") {
      f(metadata);
    }
  }

  pub fn to_yaml(&self) -> Result<String, ManifestError> {
    Ok(serde_yaml::to_string(&self.object)?)
  }

  pub fn to_json(&self) -> Result<String, ManifestError> {
    Ok(serde_json::to_string(&self.object)?)
  }

  pub fn annotations(&self) -> BTreeMap<String, String> {
    self
      .nested_string_map(&["metadata", "annotations"])
      .ok()
      .flatten()
      .unwrap_or_default()
  }

  pub fn annotation(&self, key: &str) -> Option<&str> {
    self
      .object
      .get("metadata")
      .and_then(|m| m.get("annotations"))
      .and_then(|a| a.get(key))
      .and_then(Value::as_str)
  }

  pub fn labels(&self) -> BTreeMap<String, String> {
    self
      .nested_string_map(&["metadata", "labels"])
      .ok()
      .flatten()
      .unwrap_or_default()
  }

  /// Merge `annotations` into the existing ones.
  pub fn add_annotations(&mut self, annotations: &BTreeMap<String, String>) {
    if annotations.is_empty() {
      return;
    }
    self.with_metadata(|m| {
      let entry = m
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
      if !entry.is_object() {
        *entry = Value::Object(Map::new());
      }
      if let Value::Object(existing) = entry {
        for (k, v) in annotations {
          existing.insert(k.clone(), Value::String(v.clone()));
        }
      }
    });
  }

  pub fn nested_field(&self, fields: &[&str]) -> Option<&Value> {
    let (first, rest) = fields.split_first()?;
    let mut current = self.object.get(*first)?;
    for field in rest {
      current = current.as_object()?.get(*field)?;
    }
    Some(current)
  }

  pub fn nested_field_mut(&mut self, fields: &[&str]) -> Option<&mut Value> {
    let (first, rest) = fields.split_first()?;
    let mut current = self.object.get_mut(*first)?;
    for field in rest {
      current = current.as_object_mut()?.get_mut(*field)?;
    }
    Some(current)
  }

  /// Set a nested field, creating intermediate objects.
  pub fn set_nested_field(&mut self, fields: &[&str], value: Value) -> Result<(), ManifestError> {
    let Some((last, parents)) = fields.split_last() else {
      return Ok(());
    };
    let mut current = &mut self.object;
    for (i, field) in parents.iter().enumerate() {
      let entry = current
        .entry(field.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
      if entry.is_null() {
        *entry = Value::Object(Map::new());
      }
      current = entry.as_object_mut().ok_or_else(|| ManifestError::FieldType {
        path: fields[..=i].join("."),
        expected: "an object",
      })?;
    }
    current.insert(last.to_string(), value);
    Ok(())
  }

  pub fn remove_nested_field(&mut self, fields: &[&str]) -> Option<Value> {
    let (last, parents) = fields.split_last()?;
    if parents.is_empty() {
      return self.object.remove(*last);
    }
    self.nested_field_mut(parents)?.as_object_mut()?.remove(*last)
  }

  /// Read a nested `map[string]string`. `Ok(None)` when the field is absent.
  pub fn nested_string_map(&self, fields: &[&str]) -> Result<Option<BTreeMap<String, String>>, ManifestError> {
    let Some(value) = self.nested_field(fields) else {
      return Ok(None);
    };
    if value.is_null() {
      return Ok(None);
    }
    let map = value.as_object().ok_or_else(|| ManifestError::FieldType {
      path: fields.join("."),
      expected: "a string map",
    })?;
    map
      .iter()
      .map(|(k, v)| match v {
        Value::String(s) => Ok((k.clone(), s.clone())),
        _ => Err(ManifestError::FieldType {
          path: format!("{}.{}", fields.join("."), k),
          expected: "a string",
        }),
      })
      .collect::<Result<BTreeMap<_, _>, _>>()
      .map(Some)
  }

  pub fn set_nested_string_map(
    &mut self,
    values: &BTreeMap<String, String>,
    fields: &[&str],
  ) -> Result<(), ManifestError> {
    let map = values
      .iter()
      .map(|(k, v)| (k.clone(), Value::String(v.clone())))
      .collect::<Map<_, _>>();
    self.set_nested_field(fields, Value::Object(map))
  }

  /// Merge `values` into the string map at `fields`.
  pub fn add_string_map_values(
    &mut self,
    values: &BTreeMap<String, String>,
    fields: &[&str],
  ) -> Result<(), ManifestError> {
    let mut current = self.nested_string_map(fields)?.unwrap_or_default();
    current.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
    self.set_nested_string_map(&current, fields)
  }

  pub fn spec(&self) -> Result<&Value, ManifestError> {
    self
      .object
      .get("spec")
      .ok_or_else(|| ManifestError::FieldNotFound("spec".to_string()))
  }

  /// Replace `spec` with the serialized form of `spec`.
  pub fn set_structured_spec<T: Serialize>(&mut self, spec: &T) -> Result<(), ManifestError> {
    let value = serde_json::to_value(spec)?;
    self.object.insert("spec".to_string(), value);
    Ok(())
  }

  pub fn set_replicas(&mut self, replicas: i32) -> Result<(), ManifestError> {
    self.set_nested_field(&["spec", "replicas"], Value::from(replicas))
  }

  pub fn replicas(&self) -> Option<i32> {
    self
      .nested_field(&["spec", "replicas"])
      .and_then(Value::as_i64)
      .map(|r| r as i32)
  }

  /// UIDs named in `metadata.ownerReferences`.
  pub fn owner_uids(&self) -> Vec<String> {
    self
      .nested_field(&["metadata", "ownerReferences"])
      .and_then(Value::as_array)
      .map(|refs| {
        refs
          .iter()
          .filter_map(|r| r.get("uid").and_then(Value::as_str))
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default()
  }
}

fn str_field<'a>(object: &'a Map<String, Value>, field: &str) -> &'a str {
  object.get(field).and_then(Value::as_str).unwrap_or_default()
}

/// Key of a parsed object. Objects without a namespace land in `default`.
pub fn make_resource_key(object: &Map<String, Value>) -> ResourceKey {
  let metadata = object.get("metadata");
  let meta = |field: &str| {
    metadata
      .and_then(|m| m.get(field))
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string()
  };
  let mut namespace = meta("namespace");
  if namespace.is_empty() {
    namespace = DEFAULT_NAMESPACE.to_string();
  }
  ResourceKey {
    api_version: str_field(object, "apiVersion").to_string(),
    kind: str_field(object, "kind").to_string(),
    namespace,
    name: meta("name"),
  }
}

/// Key of a live object, preferring the key stamped at apply time.
pub fn resource_key_from_live(manifest: &Manifest) -> ResourceKey {
  manifest
    .annotation(ANNOTATION_RESOURCE_KEY)
    .and_then(|k| k.parse().ok())
    .unwrap_or_else(|| manifest.key.clone())
}

/// Split a multi-document YAML stream into manifests.
///
/// Documents are separated by lines starting with `---`; empty documents are
/// skipped.
pub fn parse_manifests(data: &str) -> Result<Vec<Manifest>, ManifestError> {
  const SEPARATOR: &str = "\n---";

  let parts: Vec<&str> = data.split(SEPARATOR).collect();
  let mut manifests = Vec::with_capacity(parts.len());
  for (i, part) in parts.iter().enumerate() {
    if part.trim().is_empty() {
      continue;
    }
    // Drop whatever trails the separator on its own line, e.g. `--- # doc`.
    let body = if i == 0 {
      *part
    } else {
      part.split_once('\n').map(|(_, rest)| rest).unwrap_or_default()
    };
    if body.trim().is_empty() {
      continue;
    }
    let value: Value = serde_yaml::from_str(body)?;
    match value {
      Value::Object(object) if !object.is_empty() => manifests.push(Manifest::from_object(object)),
      Value::Null => {}
      Value::Object(_) => {}
      _ => return Err(ManifestError::NotAnObject),
    }
  }
  Ok(manifests)
}

pub fn load_manifests_from_file(path: &Path) -> Result<Vec<Manifest>, ManifestError> {
  let data = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  parse_manifests(&data)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const MULTI_DOC: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: simple
spec:
  selector:
    app: simple
---
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: simple
  namespace: apps
  annotations:
    pipecd.dev/order: "1"
spec:
  replicas: 2
"#;

  #[test]
  fn parses_multiple_documents() {
    let manifests = parse_manifests(MULTI_DOC).unwrap();
    assert_eq!(manifests.len(), 2);
    assert_eq!(manifests[0].key, ResourceKey::new("v1", "Service", "default", "simple"));
    assert_eq!(manifests[1].key, ResourceKey::new("apps/v1", "Deployment", "apps", "simple"));
    assert_eq!(manifests[1].replicas(), Some(2));
    assert_eq!(manifests[1].annotation("pipecd.dev/order"), Some("1"));
  }

  #[test]
  fn yaml_emit_is_value_preserving() {
    let manifests = parse_manifests(MULTI_DOC).unwrap();
    for m in manifests {
      let reparsed = parse_manifests(&m.to_yaml().unwrap()).unwrap();
      assert_eq!(reparsed[0], m);
    }
  }

  #[test]
  fn duplicate_is_independent() {
    let manifests = parse_manifests(MULTI_DOC).unwrap();
    let original = &manifests[1];
    let mut copy = original.duplicate("simple-canary");
    copy.set_replicas(1).unwrap();

    assert_eq!(copy.name(), "simple-canary");
    assert_eq!(copy.key.name, "simple-canary");
    assert_eq!(original.name(), "simple");
    assert_eq!(original.replicas(), Some(2));
  }

  #[test]
  fn annotations_merge() {
    let mut m = parse_manifests(MULTI_DOC).unwrap().remove(1);
    let mut extra = BTreeMap::new();
    extra.insert("a".to_string(), "b".to_string());
    extra.insert("pipecd.dev/order".to_string(), "2".to_string());
    m.add_annotations(&extra);

    let annotations = m.annotations();
    assert_eq!(annotations.get("a").map(String::as_str), Some("b"));
    assert_eq!(annotations.get("pipecd.dev/order").map(String::as_str), Some("2"));
  }

  #[test]
  fn nested_fields() {
    let mut m = Manifest::from_value(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}})).unwrap();
    m.set_nested_field(&["spec", "selector", "app"], json!("a")).unwrap();
    assert_eq!(
      m.nested_string_map(&["spec", "selector"]).unwrap().unwrap().get("app").map(String::as_str),
      Some("a")
    );
    assert!(m.nested_string_map(&["spec", "missing"]).unwrap().is_none());

    m.set_nested_field(&["spec", "ports"], json!([{"port": 80}])).unwrap();
    assert!(m.nested_string_map(&["spec", "ports"]).is_err());
    assert!(m.set_nested_field(&["spec", "ports", "x"], json!(1)).is_err());

    assert_eq!(m.remove_nested_field(&["spec", "ports"]), Some(json!([{"port": 80}])));
  }

  #[test]
  fn live_key_prefers_annotation() {
    let m = Manifest::from_value(json!({
      "apiVersion": "apps/v1",
      "kind": "Deployment",
      "metadata": {
        "name": "x",
        "annotations": {"pipecd.dev/resource-key": "apps/v1beta1:Deployment:default:x"}
      }
    }))
    .unwrap();
    assert_eq!(resource_key_from_live(&m).api_version, "apps/v1beta1");
  }

  #[test]
  fn rejects_scalar_documents() {
    assert!(parse_manifests("just a string\n").is_err());
  }
}
