//! The `pipecd.dev/config-hash` pod template annotation.
//!
//! Pods only restart when their template changes, so editing a mounted
//! ConfigMap or Secret alone would not roll a workload. Stamping a hash of
//! every config the template references makes such edits visible.

use std::collections::BTreeSet;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::manifest::{Manifest, ManifestError};
use crate::consts::ANNOTATION_CONFIG_HASH;

const HASH_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const HASH_LEN: usize = 10;

/// ConfigMap and Secret names a pod template refers to.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConfigReferences {
  pub config_maps: BTreeSet<String>,
  pub secrets: BTreeSet<String>,
}

impl ConfigReferences {
  pub fn is_empty(&self) -> bool {
    self.config_maps.is_empty() && self.secrets.is_empty()
  }
}

/// Collect references from volumes, projected volumes, `env[].valueFrom` and
/// `envFrom` of every container and init container.
pub fn find_config_references(workload: &Manifest) -> ConfigReferences {
  let mut refs = ConfigReferences::default();
  let Some(pod_spec) = workload.nested_field(&["spec", "template", "spec"]) else {
    return refs;
  };

  for volume in array(pod_spec.get("volumes")) {
    push_name(&mut refs.config_maps, volume.pointer("/configMap/name"));
    push_name(&mut refs.secrets, volume.pointer("/secret/secretName"));
    for source in array(volume.pointer("/projected/sources")) {
      push_name(&mut refs.config_maps, source.pointer("/configMap/name"));
      push_name(&mut refs.secrets, source.pointer("/secret/name"));
    }
  }

  let containers = array(pod_spec.get("containers")).chain(array(pod_spec.get("initContainers")));
  for container in containers {
    for env in array(container.get("env")) {
      push_name(&mut refs.config_maps, env.pointer("/valueFrom/configMapKeyRef/name"));
      push_name(&mut refs.secrets, env.pointer("/valueFrom/secretKeyRef/name"));
    }
    for env_from in array(container.get("envFrom")) {
      push_name(&mut refs.config_maps, env_from.pointer("/configMapRef/name"));
      push_name(&mut refs.secrets, env_from.pointer("/secretRef/name"));
    }
  }
  refs
}

fn array(value: Option<&Value>) -> impl Iterator<Item = &Value> {
  value.and_then(Value::as_array).into_iter().flatten()
}

fn push_name(set: &mut BTreeSet<String>, name: Option<&Value>) {
  if let Some(name) = name.and_then(Value::as_str) {
    if !name.is_empty() {
      set.insert(name.to_string());
    }
  }
}

/// Hash the given manifests in order.
///
/// The input is the canonical JSON of each object; keys are already sorted
/// by the object map.
pub fn hash_manifests(manifests: &[&Manifest]) -> Result<String, ManifestError> {
  let mut hasher = Sha256::new();
  for manifest in manifests {
    hasher.update(manifest.to_json()?.as_bytes());
    hasher.update(b"\n");
  }
  let digest = hasher.finalize();
  Ok(
    digest
      .iter()
      .take(HASH_LEN)
      .map(|b| HASH_ALPHABET[*b as usize % HASH_ALPHABET.len()] as char)
      .collect(),
  )
}

/// Stamp the config hash on the pod template of every workload that
/// references at least one ConfigMap or Secret present in `manifests`.
pub fn annotate_config_hash(manifests: &mut [Manifest]) -> Result<(), ManifestError> {
  let mut stamps = Vec::new();
  for (index, manifest) in manifests.iter().enumerate() {
    if !manifest.key.is_workload() {
      continue;
    }
    let refs = find_config_references(manifest);
    if refs.is_empty() {
      continue;
    }
    let referenced: Vec<&Manifest> = manifests
      .iter()
      .filter(|m| {
        (m.key.is_config_map() && refs.config_maps.contains(&m.key.name))
          || (m.key.is_secret() && refs.secrets.contains(&m.key.name))
      })
      .collect();
    if referenced.is_empty() {
      continue;
    }
    stamps.push((index, hash_manifests(&referenced)?));
  }

  for (index, hash) in stamps {
    let annotations = [(ANNOTATION_CONFIG_HASH.to_string(), hash)].into_iter().collect();
    manifests[index].add_string_map_values(&annotations, &["spec", "template", "metadata", "annotations"])?;
  }
  Ok(())
}
