//! Deriving variant manifests from the ones in Git.
//!
//! Variants are deep copies with a suffixed name and the variant label
//! merged into selectors and pod template labels.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::config::K8sResourceReference;
use crate::kubernetes::{Manifest, ManifestError};

const KIND_DEPLOYMENT: &str = "Deployment";
const KIND_SERVICE: &str = "Service";

/// `name-suffix`, or `name` when there is no suffix.
pub fn make_suffixed_name(name: &str, suffix: &str) -> String {
  if suffix.is_empty() {
    return name.to_string();
  }
  format!("{}-{}", name, suffix)
}

pub fn duplicate_manifests(manifests: &[Manifest], suffix: &str) -> Vec<Manifest> {
  manifests
    .iter()
    .map(|m| m.duplicate(&make_suffixed_name(&m.key.name, suffix)))
    .collect()
}

/// Manifests of `kind`, restricted to `name` when it is given.
pub fn find_manifests(kind: &str, name: &str, manifests: &[Manifest]) -> Vec<Manifest> {
  manifests
    .iter()
    .filter(|m| m.key.kind == kind && (name.is_empty() || m.key.name == name))
    .cloned()
    .collect()
}

/// Workloads named by `refs`; every Deployment when there are none.
pub fn find_workload_manifests(manifests: &[Manifest], refs: &[K8sResourceReference]) -> Vec<Manifest> {
  if refs.is_empty() {
    return find_manifests(KIND_DEPLOYMENT, "", manifests);
  }
  refs
    .iter()
    .flat_map(|r| {
      let kind = if r.kind.is_empty() { KIND_DEPLOYMENT } else { r.kind.as_str() };
      find_manifests(kind, &r.name, manifests)
    })
    .collect()
}

pub fn find_service_manifests(name: &str, manifests: &[Manifest]) -> Vec<Manifest> {
  find_manifests(KIND_SERVICE, name, manifests)
}

pub fn find_config_maps(manifests: &[Manifest]) -> Vec<Manifest> {
  manifests.iter().filter(|m| m.key.is_config_map()).cloned().collect()
}

pub fn find_secrets(manifests: &[Manifest]) -> Vec<Manifest> {
  manifests.iter().filter(|m| m.key.is_secret()).cloned().collect()
}

fn label(key: &str, value: &str) -> BTreeMap<String, String> {
  [(key.to_string(), value.to_string())].into_iter().collect()
}

/// Make sure the workload's selector and pod template select `variant`.
pub fn ensure_variant_selector_in_workload(m: &mut Manifest, label_key: &str, variant: &str) -> Result<(), ManifestError> {
  let variant_label = label(label_key, variant);
  m.add_string_map_values(&variant_label, &["spec", "selector", "matchLabels"])?;
  m.add_string_map_values(&variant_label, &["spec", "template", "metadata", "labels"])
}

fn check_label(m: &Manifest, fields: &[&str], label_key: &str, variant: &str) -> Result<(), String> {
  let labels = m
    .nested_string_map(fields)
    .map_err(|e| e.to_string())?
    .unwrap_or_default();
  match labels.get(label_key) {
    None => Err(format!("missing {} key in {}", label_key, fields.join("."))),
    Some(value) if value != variant => Err(format!(
      "require {} but got {} for {} key in {}",
      variant,
      value,
      label_key,
      fields.join(".")
    )),
    Some(_) => Ok(()),
  }
}

/// Fail unless the workload's selector and pod template carry `variant`.
pub fn check_variant_selector_in_workload(m: &Manifest, label_key: &str, variant: &str) -> Result<(), String> {
  check_label(m, &["spec", "selector", "matchLabels"], label_key, variant)?;
  check_label(m, &["spec", "template", "metadata", "labels"], label_key, variant)
}

/// Fail unless the service's selector pins `variant`.
pub fn check_variant_selector_in_service(m: &Manifest, label_key: &str, variant: &str) -> Result<(), String> {
  let selector = m
    .nested_string_map(&["spec", "selector"])
    .map_err(|e| e.to_string())?
    .unwrap_or_default();
  match selector.get(label_key) {
    None => Err(format!("missing {} key in the selector", label_key)),
    Some(value) if value != variant => Err(format!(
      "want {} but got {} for {} key in the selector",
      variant, value, label_key
    )),
    Some(_) => Ok(()),
  }
}

/// ClusterIP copies of `services` selecting only pods of `variant`.
pub fn generate_variant_service_manifests(
  services: &[Manifest],
  label_key: &str,
  variant: &str,
  suffix: &str,
) -> Result<Vec<Manifest>, ManifestError> {
  services
    .iter()
    .map(|s| {
      let mut m = s.duplicate(&make_suffixed_name(&s.key.name, suffix));
      m.set_nested_field(&["spec", "type"], Value::String("ClusterIP".to_string()))?;
      m.add_string_map_values(&label(label_key, variant), &["spec", "selector"])?;
      for field in ["externalIPs", "loadBalancerIP", "loadBalancerSourceRanges"] {
        m.remove_nested_field(&["spec", field]);
      }
      if let Some(ports) = m.nested_field_mut(&["spec", "ports"]).and_then(Value::as_array_mut) {
        for port in ports.iter_mut().filter_map(Value::as_object_mut) {
          port.remove("nodePort");
        }
      }
      Ok(m)
    })
    .collect()
}

/// Workload copies for `variant`.
///
/// References to the ConfigMaps and Secrets in `config_maps` and `secrets`
/// are renamed with the same suffix so the copies mount the variant's own
/// configs. Replicas are recomputed by `replicas`, which receives the
/// current count when there is one.
pub fn generate_variant_workload_manifests(
  workloads: &[Manifest],
  config_maps: &[Manifest],
  secrets: &[Manifest],
  label_key: &str,
  variant: &str,
  suffix: &str,
  replicas: impl Fn(Option<i32>) -> i32,
) -> Result<Vec<Manifest>, ManifestError> {
  let config_map_names: BTreeSet<&str> = config_maps.iter().map(|m| m.key.name.as_str()).collect();
  let secret_names: BTreeSet<&str> = secrets.iter().map(|m| m.key.name.as_str()).collect();

  workloads
    .iter()
    .map(|w| {
      if w.key.kind != KIND_DEPLOYMENT {
        return Err(ManifestError::Unsupported(format!("workload kind {}", w.key.kind)));
      }
      let mut m = w.duplicate(&make_suffixed_name(&w.key.name, suffix));
      m.set_replicas(replicas(w.replicas()))?;
      ensure_variant_selector_in_workload(&mut m, label_key, variant)?;
      if let Some(pod) = m.nested_field_mut(&["spec", "template", "spec"]) {
        rename_config_references(pod, &config_map_names, &secret_names, suffix);
      }
      Ok(m)
    })
    .collect()
}

fn rename_config_references(pod: &mut Value, config_maps: &BTreeSet<&str>, secrets: &BTreeSet<&str>, suffix: &str) {
  let rename = |value: Option<&mut Value>, known: &BTreeSet<&str>| {
    if let Some(Value::String(name)) = value {
      if known.contains(name.as_str()) {
        *name = make_suffixed_name(name, suffix);
      }
    }
  };

  if let Some(volumes) = pod.get_mut("volumes").and_then(Value::as_array_mut) {
    for volume in volumes {
      rename(volume.pointer_mut("/configMap/name"), config_maps);
      rename(volume.pointer_mut("/secret/secretName"), secrets);
    }
  }

  for containers in ["containers", "initContainers"] {
    let Some(containers) = pod.get_mut(containers).and_then(Value::as_array_mut) else {
      continue;
    };
    for container in containers {
      if let Some(env) = container.get_mut("env").and_then(Value::as_array_mut) {
        for e in env {
          rename(e.pointer_mut("/valueFrom/configMapKeyRef/name"), config_maps);
          rename(e.pointer_mut("/valueFrom/secretKeyRef/name"), secrets);
        }
      }
      if let Some(env_from) = container.get_mut("envFrom").and_then(Value::as_array_mut) {
        for e in env_from {
          rename(e.pointer_mut("/configMapRef/name"), config_maps);
          rename(e.pointer_mut("/secretRef/name"), secrets);
        }
      }
    }
  }
}
