//! Applying manifests to one cluster.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use super::kubectl::{Kubectl, KubectlError};
use super::manifest::Manifest;
use super::resource_key::ResourceKey;
use crate::config::{KubernetesDeploymentInput, KubernetesProviderConfig};
use crate::consts::ANNOTATION_RESOURCE_KEY;
use crate::toolregistry::Registry;

/// Write access to a cluster.
#[async_trait]
pub trait Applier: Send + Sync {
  async fn apply_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError>;

  async fn create_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError>;

  /// Replace an existing resource; [`KubectlError::NotFound`] when absent.
  async fn replace_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError>;

  /// Delete the resource identified by `key`.
  ///
  /// Only resources whose `pipecd.dev/resource-key` annotation equals `key`
  /// are deleted; anything else is reported as not found.
  async fn delete(&self, key: &ResourceKey) -> Result<(), KubectlError>;
}

/// [`Applier`] backed by `kubectl`.
///
/// The binary is resolved through the tool registry on first use.
pub struct KubectlApplier {
  input: KubernetesDeploymentInput,
  provider: KubernetesProviderConfig,
  registry: Arc<Registry>,
  kubectl: OnceCell<Kubectl>,
}

impl KubectlApplier {
  pub fn new(input: KubernetesDeploymentInput, provider: KubernetesProviderConfig, registry: Arc<Registry>) -> Self {
    Self {
      input,
      provider,
      registry,
      kubectl: OnceCell::new(),
    }
  }

  /// Use a known binary instead of the registry.
  pub fn with_kubectl(input: KubernetesDeploymentInput, provider: KubernetesProviderConfig, registry: Arc<Registry>, kubectl: Kubectl) -> Self {
    Self {
      input,
      provider,
      registry,
      kubectl: OnceCell::new_with(Some(kubectl)),
    }
  }

  async fn kubectl(&self) -> Result<&Kubectl, KubectlError> {
    self
      .kubectl
      .get_or_try_init(|| async {
        let version = self.tool_version();
        let ensured = self
          .registry
          .kubectl(&version)
          .await
          .map_err(|source| KubectlError::Tool {
            version: version.clone(),
            source,
          })?;
        if ensured.installed {
          info!(version = %version, "kubectl has just been installed because of no pre-installed binary for that version");
        }
        Ok(Kubectl::new(version, ensured.path))
      })
      .await
  }

  fn namespace_for(&self, key: &ResourceKey) -> String {
    if !self.input.namespace.is_empty() {
      return self.input.namespace.clone();
    }
    key.namespace.clone()
  }

  fn tool_version(&self) -> String {
    if !self.input.kubectl_version.is_empty() {
      return self.input.kubectl_version.clone();
    }
    self.provider.kubectl_version.clone()
  }

  async fn ensure_namespace(&self, kubectl: &Kubectl, namespace: &str) -> Result<(), KubectlError> {
    if self.input.auto_create_namespace && !namespace.is_empty() {
      kubectl.create_namespace(&self.provider.kubeconfig_path, namespace).await?;
    }
    Ok(())
  }
}

#[async_trait]
impl Applier for KubectlApplier {
  async fn apply_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError> {
    let kubectl = self.kubectl().await?;
    let namespace = self.namespace_for(&manifest.key);
    self.ensure_namespace(kubectl, &namespace).await?;
    kubectl.apply(&self.provider.kubeconfig_path, &namespace, manifest).await
  }

  async fn create_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError> {
    let kubectl = self.kubectl().await?;
    let namespace = self.namespace_for(&manifest.key);
    self.ensure_namespace(kubectl, &namespace).await?;
    kubectl.create(&self.provider.kubeconfig_path, &namespace, manifest).await
  }

  async fn replace_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError> {
    let kubectl = self.kubectl().await?;
    kubectl
      .replace(&self.provider.kubeconfig_path, &self.namespace_for(&manifest.key), manifest)
      .await
  }

  async fn delete(&self, key: &ResourceKey) -> Result<(), KubectlError> {
    let kubectl = self.kubectl().await?;
    let namespace = self.namespace_for(key);

    let live = kubectl.get(&self.provider.kubeconfig_path, &namespace, key).await?;
    let expected = key.to_string();
    if live.annotation(ANNOTATION_RESOURCE_KEY) != Some(expected.as_str()) {
      return Err(KubectlError::NotFound(format!(
        "{} is not managed under that key",
        key.readable_string()
      )));
    }

    kubectl.delete(&self.provider.kubeconfig_path, &namespace, key).await
  }
}

/// Apply the manifest by replace, falling back to create when it is absent.
pub async fn replace_or_create<A: Applier + ?Sized>(applier: &A, manifest: &Manifest) -> Result<(), KubectlError> {
  match applier.replace_manifest(manifest).await {
    Err(err) if err.is_not_found() => applier.create_manifest(manifest).await,
    other => other,
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::util::testutil::{recorded_args, write_script};
  use tempfile::TempDir;

  /// Fake kubectl whose `get` returns a Service annotated with `stamped_key`.
  fn fake_kubectl(dir: &std::path::Path, stamped_key: &str) -> Kubectl {
    let body = format!(
      r#"echo "$@" >> '{args}'
case "$*" in
  *" get "*)
    printf 'apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n  namespace: apps\n  annotations:\n    pipecd.dev/resource-key: "{key}"\n'
    ;;
esac
exit 0"#,
      args = dir.join("kubectl.args").display(),
      key = stamped_key
    );
    Kubectl::new("1.18.2", write_script(dir, "kubectl", &body))
  }

  fn applier(temp: &TempDir, kubectl: Kubectl, input: KubernetesDeploymentInput) -> KubectlApplier {
    let registry = Arc::new(Registry::empty(temp.path().join("bin")).unwrap());
    KubectlApplier::with_kubectl(input, KubernetesProviderConfig::default(), registry, kubectl)
  }

  #[tokio::test]
  async fn delete_requires_matching_resource_key() {
    let temp = TempDir::new().unwrap();
    let key = ResourceKey::new("v1", "Service", "apps", "web");

    let foreign = applier(
      &temp,
      fake_kubectl(temp.path(), "v1:Service:other:web"),
      KubernetesDeploymentInput::default(),
    );
    let err = foreign.delete(&key).await.unwrap_err();
    assert!(err.is_not_found());
    let calls = recorded_args(temp.path(), "kubectl");
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains(" get Service web"));
  }

  #[tokio::test]
  async fn delete_runs_when_key_matches() {
    let temp = TempDir::new().unwrap();
    let key = ResourceKey::new("v1", "Service", "apps", "web");

    let owned = applier(
      &temp,
      fake_kubectl(temp.path(), "v1:Service:apps:web"),
      KubernetesDeploymentInput::default(),
    );
    owned.delete(&key).await.unwrap();
    let calls = recorded_args(temp.path(), "kubectl");
    assert_eq!(calls.last().unwrap(), "--namespace apps delete Service web");
  }

  #[tokio::test]
  async fn auto_create_namespace_runs_before_apply() {
    let temp = TempDir::new().unwrap();
    let input = KubernetesDeploymentInput {
      namespace: "team".to_string(),
      auto_create_namespace: true,
      ..Default::default()
    };
    let a = applier(&temp, fake_kubectl(temp.path(), ""), input);
    let m = crate::kubernetes::manifest::parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n")
      .unwrap()
      .remove(0);
    a.apply_manifest(&m).await.unwrap();

    assert_eq!(
      recorded_args(temp.path(), "kubectl"),
      vec!["create namespace team", "--namespace team apply -f -"]
    );
  }
}
