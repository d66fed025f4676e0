//! Identity of a Kubernetes resource.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const KIND_DEPLOYMENT: &str = "Deployment";
pub const KIND_STATEFUL_SET: &str = "StatefulSet";
pub const KIND_DAEMON_SET: &str = "DaemonSet";
pub const KIND_REPLICA_SET: &str = "ReplicaSet";
pub const KIND_POD: &str = "Pod";
pub const KIND_CONFIG_MAP: &str = "ConfigMap";
pub const KIND_SECRET: &str = "Secret";
pub const KIND_SERVICE: &str = "Service";
pub const KIND_NAMESPACE: &str = "Namespace";
pub const KIND_VIRTUAL_SERVICE: &str = "VirtualService";

pub const DEFAULT_NAMESPACE: &str = "default";
pub const ISTIO_NETWORKING_GROUP: &str = "networking.istio.io";

const BUILT_IN_API_VERSIONS: &[&str] = &[
  "admissionregistration.k8s.io/v1",
  "admissionregistration.k8s.io/v1beta1",
  "apiextensions.k8s.io/v1",
  "apiextensions.k8s.io/v1beta1",
  "apiregistration.k8s.io/v1",
  "apiregistration.k8s.io/v1beta1",
  "apps/v1",
  "authentication.k8s.io/v1",
  "authentication.k8s.io/v1beta1",
  "authorization.k8s.io/v1",
  "authorization.k8s.io/v1beta1",
  "autoscaling/v1",
  "autoscaling/v2",
  "autoscaling/v2beta1",
  "autoscaling/v2beta2",
  "batch/v1",
  "batch/v1beta1",
  "certificates.k8s.io/v1beta1",
  "coordination.k8s.io/v1",
  "coordination.k8s.io/v1beta1",
  "extensions/v1beta1",
  "internal.autoscaling.k8s.io/v1alpha1",
  "metrics.k8s.io/v1beta1",
  "networking.k8s.io/v1",
  "networking.k8s.io/v1beta1",
  "node.k8s.io/v1beta1",
  "policy/v1",
  "policy/v1beta1",
  "rbac.authorization.k8s.io/v1",
  "rbac.authorization.k8s.io/v1beta1",
  "scheduling.k8s.io/v1",
  "scheduling.k8s.io/v1beta1",
  "storage.k8s.io/v1",
  "storage.k8s.io/v1beta1",
  "v1",
];

/// Whether `api_version` belongs to a resource shipped with Kubernetes.
pub fn is_builtin_api_version(api_version: &str) -> bool {
  BUILT_IN_API_VERSIONS.contains(&api_version)
}

/// An `(apiVersion, kind)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiVersionKind {
  pub api_version: String,
  pub kind: String,
}

impl ApiVersionKind {
  pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
    Self {
      api_version: api_version.into(),
      kind: kind.into(),
    }
  }
}

impl fmt::Display for ApiVersionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.api_version, self.kind)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed resource key: {0}")]
pub struct MalformedKey(pub String);

/// `(apiVersion, kind, namespace, name)`.
///
/// Ordering is lexicographic over the four fields in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
  pub api_version: String,
  pub kind: String,
  pub namespace: String,
  pub name: String,
}

impl ResourceKey {
  pub fn new(
    api_version: impl Into<String>,
    kind: impl Into<String>,
    namespace: impl Into<String>,
    name: impl Into<String>,
  ) -> Self {
    Self {
      api_version: api_version.into(),
      kind: kind.into(),
      namespace: namespace.into(),
      name: name.into(),
    }
  }

  pub fn api_version_kind(&self) -> ApiVersionKind {
    ApiVersionKind::new(&self.api_version, &self.kind)
  }

  /// `name="..", kind="..", namespace="..", apiVersion=".."` for log lines.
  pub fn readable_string(&self) -> String {
    format!(
      "name={:?}, kind={:?}, namespace={:?}, apiVersion={:?}",
      self.name, self.kind, self.namespace, self.api_version
    )
  }

  pub fn is_zero(&self) -> bool {
    self.api_version.is_empty() && self.kind.is_empty() && self.namespace.is_empty() && self.name.is_empty()
  }

  fn is_builtin_kind(&self, kind: &str) -> bool {
    self.kind == kind && is_builtin_api_version(&self.api_version)
  }

  pub fn is_deployment(&self) -> bool {
    self.is_builtin_kind(KIND_DEPLOYMENT)
  }

  pub fn is_replica_set(&self) -> bool {
    self.is_builtin_kind(KIND_REPLICA_SET)
  }

  /// Workloads are deleted after every other kind when cleaning variants.
  pub fn is_workload(&self) -> bool {
    is_builtin_api_version(&self.api_version)
      && matches!(
        self.kind.as_str(),
        KIND_DEPLOYMENT | KIND_REPLICA_SET | KIND_DAEMON_SET | KIND_POD | KIND_STATEFUL_SET
      )
  }

  pub fn is_service(&self) -> bool {
    self.is_builtin_kind(KIND_SERVICE)
  }

  pub fn is_config_map(&self) -> bool {
    self.is_builtin_kind(KIND_CONFIG_MAP)
  }

  pub fn is_secret(&self) -> bool {
    self.is_builtin_kind(KIND_SECRET)
  }

  pub fn is_virtual_service(&self) -> bool {
    self.kind == KIND_VIRTUAL_SERVICE && self.api_version.starts_with(&format!("{}/", ISTIO_NETWORKING_GROUP))
  }

  pub fn cmp_ignoring_namespace(&self, other: &ResourceKey) -> Ordering {
    (&self.api_version, &self.kind, &self.name).cmp(&(&other.api_version, &other.kind, &other.name))
  }

  pub fn eq_ignoring_namespace(&self, other: &ResourceKey) -> bool {
    self.cmp_ignoring_namespace(other) == Ordering::Equal
  }

  /// Copy of this key with an empty namespace replaced by `namespace`.
  pub fn with_default_namespace(&self, namespace: &str) -> ResourceKey {
    let mut key = self.clone();
    if key.namespace.is_empty() {
      key.namespace = namespace.to_string();
    }
    key
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}:{}", self.api_version, self.kind, self.namespace, self.name)
  }
}

impl FromStr for ResourceKey {
  type Err = MalformedKey;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
      [api_version, kind, namespace, name] => Ok(ResourceKey::new(*api_version, *kind, *namespace, *name)),
      _ => Err(MalformedKey(s.to_string())),
    }
  }
}
