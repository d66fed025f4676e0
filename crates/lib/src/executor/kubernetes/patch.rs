//! Patches applied to canary manifests.
//!
//! Paths look like `$.spec.template.spec.containers[0].image`. With a
//! document root the patch edits the YAML document stored as a string at
//! that path instead of the manifest itself.

use serde_json::Value;

use super::{K8sStageError, failed};
use crate::config::{K8sResourcePatch, K8sResourcePatchOp, K8sResourcePatchOpName};
use crate::kubernetes::Manifest;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
  Field(String),
  Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>, K8sStageError> {
  let invalid = || failed(format!("invalid patch path {:?}", path));
  let rest = path.strip_prefix('$').ok_or_else(invalid)?;
  let mut segments = Vec::new();
  for part in rest.split('.').skip(1) {
    let (field, mut indexes) = match part.find('[') {
      Some(i) => (&part[..i], &part[i..]),
      None => (part, ""),
    };
    if field.is_empty() {
      return Err(invalid());
    }
    segments.push(Segment::Field(field.to_string()));
    while let Some(stripped) = indexes.strip_prefix('[') {
      let (index, tail) = stripped.split_once(']').ok_or_else(invalid)?;
      segments.push(Segment::Index(index.parse().map_err(|_| invalid())?));
      indexes = tail;
    }
    if !indexes.is_empty() {
      return Err(invalid());
    }
  }
  Ok(segments)
}

fn lookup_mut<'a>(root: &'a mut Value, path: &str) -> Result<&'a mut Value, K8sStageError> {
  let mut current = root;
  for segment in parse_path(path)? {
    let next = match segment {
      Segment::Field(name) => current.get_mut(name.as_str()),
      Segment::Index(i) => current.get_mut(i),
    };
    current = next.ok_or_else(|| failed(format!("path {} was not found", path)))?;
  }
  Ok(current)
}

fn apply_op(root: &mut Value, op: &K8sResourcePatchOp) -> Result<(), K8sStageError> {
  match op.op {
    K8sResourcePatchOpName::YamlReplace => {
      let value: Value = serde_yaml::from_str(&op.value)
        .map_err(|e| failed(format!("invalid value for patch path {}: {}", op.path, e)))?;
      *lookup_mut(root, &op.path)? = value;
    }
  }
  Ok(())
}

/// Apply `patch` to the first manifest it targets.
pub(super) fn apply_patch(manifests: &mut [Manifest], patch: &K8sResourcePatch) -> Result<(), K8sStageError> {
  let target = &patch.target;
  let Some(manifest) = manifests
    .iter_mut()
    .find(|m| m.key.kind == target.reference.kind && m.key.name == target.reference.name)
  else {
    return Err(failed(format!(
      "no manifest matches the given patch: kind={}, name={}",
      target.reference.kind, target.reference.name
    )));
  };

  let mut object = manifest.to_value();
  if target.document_root.is_empty() {
    for op in &patch.ops {
      apply_op(&mut object, op)?;
    }
  } else {
    let field = lookup_mut(&mut object, &target.document_root)?;
    let Some(text) = field.as_str() else {
      return Err(failed(format!("{} is not a string field", target.document_root)));
    };
    let mut document: Value = serde_yaml::from_str(text)
      .map_err(|e| failed(format!("unable to parse document at {}: {}", target.document_root, e)))?;
    for op in &patch.ops {
      apply_op(&mut document, op)?;
    }
    let rendered = serde_yaml::to_string(&document)
      .map_err(|e| failed(format!("unable to render document at {}: {}", target.document_root, e)))?;
    *field = Value::String(rendered);
  }

  let key = manifest.key.clone();
  *manifest = Manifest::from_value(object)?;
  manifest.key = key;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{K8sResourcePatchTarget, K8sResourceReference};
  use crate::kubernetes::manifest::parse_manifests;

  const MANIFESTS: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  template:
    spec:
      containers:
        - name: web
          image: ghcr.io/acme/web:v1
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: envoy
data:
  envoy.yaml: |
    admin:
      port: 9901
    cluster: primary
"#;

  fn patch(kind: &str, name: &str, root: &str, path: &str, value: &str) -> K8sResourcePatch {
    K8sResourcePatch {
      target: K8sResourcePatchTarget {
        reference: K8sResourceReference {
          kind: kind.to_string(),
          name: name.to_string(),
        },
        document_root: root.to_string(),
      },
      ops: vec![K8sResourcePatchOp {
        op: K8sResourcePatchOpName::YamlReplace,
        path: path.to_string(),
        value: value.to_string(),
      }],
    }
  }

  #[test]
  fn path_parsing() {
    assert_eq!(
      parse_path("$.spec.containers[0].image").unwrap(),
      vec![
        Segment::Field("spec".to_string()),
        Segment::Field("containers".to_string()),
        Segment::Index(0),
        Segment::Field("image".to_string()),
      ]
    );
    assert!(parse_path("spec.replicas").is_err());
    assert!(parse_path("$.spec[x]").is_err());
  }

  #[test]
  fn replaces_field_of_manifest() {
    let mut manifests = parse_manifests(MANIFESTS).unwrap();
    apply_patch(
      &mut manifests,
      &patch(
        "Deployment",
        "web",
        "",
        "$.spec.template.spec.containers[0].image",
        "ghcr.io/acme/web:v2",
      ),
    )
    .unwrap();
    assert_eq!(
      manifests[0].to_value().pointer("/spec/template/spec/containers/0/image"),
      Some(&Value::from("ghcr.io/acme/web:v2"))
    );
  }

  #[test]
  fn replaces_field_of_embedded_document() {
    let mut manifests = parse_manifests(&MANIFESTS.replace("envoy.yaml", "config")).unwrap();
    apply_patch(&mut manifests, &patch("ConfigMap", "envoy", "$.data.config", "$.cluster", "canary")).unwrap();
    let text = manifests[1].to_value()["data"]["config"].as_str().unwrap().to_string();
    let document: Value = serde_yaml::from_str(&text).unwrap();
    assert_eq!(document["cluster"], Value::from("canary"));
    assert_eq!(document["admin"]["port"], Value::from(9901));
  }

  #[test]
  fn unmatched_target_fails() {
    let mut manifests = parse_manifests(MANIFESTS).unwrap();
    let err = apply_patch(&mut manifests, &patch("Deployment", "api", "", "$.spec", "{}")).unwrap_err();
    assert_eq!(
      err.to_string(),
      "no manifest matches the given patch: kind=Deployment, name=api"
    );
  }
}
