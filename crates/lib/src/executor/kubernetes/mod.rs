//! Stages of Kubernetes deployments.
//!
//! Each stage loads the application config at the deployed commit (the
//! running one for `Rollback`), renders its manifests, derives what it needs
//! and hands the result to an [`ApplierGroup`].

pub mod applier_group;
mod baseline;
mod canary;
mod patch;
mod primary;
mod rollback;
mod sync;
mod traffic;
pub mod variant;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use self::applier_group::{ApplierGroup, ApplyError};
use super::{ExecutorError, Input, MetadataStore, StageStatus};
use crate::config::{ConfigError, KubernetesApplicationSpec, KubernetesDeploymentInput, StageName, load_application_config};
use crate::consts::{
  ANNOTATION_APPLICATION, ANNOTATION_COMMIT_HASH, ANNOTATION_MANAGED_BY, ANNOTATION_ORIGINAL_API_VERSION,
  ANNOTATION_PIPED, ANNOTATION_RESOURCE_KEY, ANNOTATION_SYNC_BY_REPLACE, MANAGED_BY_PIPED, PRUNE_DEBOUNCE,
  SYNC_BY_REPLACE_ENABLED,
};
use crate::kubernetes::config_hash::annotate_config_hash;
use crate::kubernetes::manifest::resource_key_from_live;
use crate::kubernetes::resource_key::DEFAULT_NAMESPACE;
use crate::kubernetes::{Loader, LoaderError, LoaderInput, Manifest, ManifestError, ResourceKey};

#[derive(Debug, Error)]
pub enum K8sStageError {
  #[error(transparent)]
  Executor(#[from] ExecutorError),

  #[error("Failed while loading application config ({0})")]
  Config(#[from] ConfigError),

  #[error("Failed while loading manifests ({0})")]
  Load(#[from] LoaderError),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error("Failed while applying manifests ({0})")]
  Apply(#[from] ApplyError),

  #[error("{0}")]
  Failed(String),
}

fn failed(message: impl Into<String>) -> K8sStageError {
  K8sStageError::Failed(message.into())
}

/// Run a Kubernetes stage. Failures are written to the stage log.
pub async fn execute(input: &Input) -> StageStatus {
  match run(input).await {
    Ok(()) => StageStatus::Success,
    Err(err) => {
      input.log.error(&err.to_string());
      StageStatus::Failure
    }
  }
}

async fn run(input: &Input) -> Result<(), K8sStageError> {
  let name = input.stage.name();
  let app_dir = match name {
    StageName::Rollback => rollback::running_app_dir(input)?,
    _ => input.deployment.app_dir(),
  };
  let spec = load_application_config(&app_dir, input.deployment.app.config_filename())?.kubernetes_spec()?;
  let appliers = ApplierGroup::new(&spec, &input.deployment.app.platform_provider, input.clients.as_ref())?;
  let exec = KubernetesExecutor { input, spec, appliers };

  match name {
    StageName::K8sSync => sync::run(&exec).await,
    StageName::K8sPrimaryRollout => primary::run(&exec).await,
    StageName::K8sCanaryRollout => canary::rollout(&exec).await,
    StageName::K8sCanaryClean => canary::clean(&exec).await,
    StageName::K8sBaselineRollout => baseline::rollout(&exec).await,
    StageName::K8sBaselineClean => baseline::clean(&exec).await,
    StageName::K8sTrafficRouting => traffic::run(&exec).await,
    StageName::Rollback => rollback::run(&exec).await,
    other => Err(failed(format!("Unsupported stage {} for Kubernetes application", other))),
  }
}

/// State shared by the stage implementations.
pub(crate) struct KubernetesExecutor<'a> {
  input: &'a Input,
  spec: KubernetesApplicationSpec,
  appliers: ApplierGroup,
}

impl KubernetesExecutor<'_> {
  fn log_info(&self, message: &str) {
    self.input.log.info(message);
  }

  fn log_success(&self, message: &str) {
    self.input.log.success(message);
  }

  fn log_error(&self, message: &str) {
    self.input.log.error(message);
  }

  fn variant_label(&self) -> &str {
    &self.spec.variant_label.key
  }

  /// Namespace resources without one end up in.
  fn namespace(&self) -> &str {
    if self.spec.input.namespace.is_empty() {
      DEFAULT_NAMESPACE
    } else {
      &self.spec.input.namespace
    }
  }

  /// Manifests at the deployed commit.
  async fn load_manifests(&self) -> Result<Vec<Manifest>, K8sStageError> {
    let deployment = &self.input.deployment;
    self
      .load_manifests_at(&deployment.repo_dir, &deployment.commit, &self.spec.input)
      .await
  }

  /// Manifests at the last successfully deployed commit, rendered with the
  /// config of that commit.
  async fn load_running_manifests(&self) -> Result<Vec<Manifest>, K8sStageError> {
    let deployment = &self.input.deployment;
    let repo_dir = match (&deployment.running_repo_dir, deployment.running_commit.is_empty()) {
      (Some(dir), false) => dir,
      _ => return Err(failed("Unable to determine the last deployed commit")),
    };
    let spec = load_application_config(&repo_dir.join(&deployment.app.path), deployment.app.config_filename())?
      .kubernetes_spec()?;
    self
      .load_manifests_at(repo_dir, &deployment.running_commit, &spec.input)
      .await
  }

  async fn load_manifests_at(
    &self,
    repo_dir: &Path,
    commit: &str,
    input: &KubernetesDeploymentInput,
  ) -> Result<Vec<Manifest>, K8sStageError> {
    let app = &self.input.deployment.app;
    let cache_key = (app.id.clone(), commit.to_string());
    if let Some(manifests) = self.input.manifests_cache.get(&cache_key).await {
      debug!(commit, "manifests were loaded from cache");
      return Ok(manifests.as_ref().clone());
    }

    let loader_input = LoaderInput {
      app_name: app.name.clone(),
      app_dir: repo_dir.join(&app.path),
      repo_dir: repo_dir.to_path_buf(),
      config_filename: app.config_filename().to_string(),
      input: input.clone(),
    };
    let mut loader = Loader::new(loader_input, self.input.registry.clone());
    if let Some(git) = &self.input.git {
      loader = loader.with_git(git.clone());
    }
    if let Some(chart_repos) = &self.input.chart_repos {
      loader = loader.with_chart_repos(chart_repos.clone());
    }
    let manifests = loader.load_manifests().await?;
    self
      .input
      .manifests_cache
      .insert(cache_key, Arc::new(manifests.clone()))
      .await;
    Ok(manifests)
  }

  /// Stamp the annotations every piped-managed resource carries.
  fn add_builtin_annotations(&self, manifests: &mut [Manifest], variant: &str, commit: &str) {
    for m in manifests.iter_mut() {
      let annotations: BTreeMap<String, String> = [
        (ANNOTATION_MANAGED_BY, MANAGED_BY_PIPED.to_string()),
        (ANNOTATION_PIPED, self.input.piped_id.clone()),
        (ANNOTATION_APPLICATION, self.input.deployment.app.id.clone()),
        (self.variant_label(), variant.to_string()),
        (ANNOTATION_ORIGINAL_API_VERSION, m.key.api_version.clone()),
        (ANNOTATION_RESOURCE_KEY, m.key.to_string()),
        (ANNOTATION_COMMIT_HASH, commit.to_string()),
      ]
      .into_iter()
      .map(|(k, v)| (k.to_string(), v))
      .collect();
      m.add_annotations(&annotations);
    }
  }

  /// Annotate, hash configs and apply.
  async fn annotate_and_apply(&self, manifests: &mut [Manifest], variant: &str, commit: &str) -> Result<(), K8sStageError> {
    self.add_builtin_annotations(manifests, variant, commit);
    annotate_config_hash(manifests)?;
    self.apply_manifests(manifests).await
  }

  async fn apply_manifests(&self, manifests: &[Manifest]) -> Result<(), K8sStageError> {
    if manifests.is_empty() {
      self.log_info("This application has no Kubernetes manifests to handle");
      return Ok(());
    }
    self.log_info("Start applying manifests");
    for m in manifests {
      if m.annotation(ANNOTATION_SYNC_BY_REPLACE) == Some(SYNC_BY_REPLACE_ENABLED) {
        self.appliers.replace_or_create(m).await?;
        self.log_info(&format!("- replaced or created manifest: {}", m.key.readable_string()));
      } else {
        self.appliers.apply_manifest(m).await?;
        self.log_info(&format!("- applied manifest: {}", m.key.readable_string()));
      }
    }
    self.log_success(&format!("Successfully applied {} manifests", manifests.len()));
    Ok(())
  }

  /// Delete `keys`, workloads last.
  ///
  /// Missing resources and per-resource failures are logged and skipped; a
  /// resource no provider claims aborts the deletion.
  async fn delete_resources(&self, keys: &[ResourceKey]) -> Result<(), K8sStageError> {
    if keys.is_empty() {
      self.log_info("There are no resources to delete");
      return Ok(());
    }
    let (workloads, others): (Vec<&ResourceKey>, Vec<&ResourceKey>) = keys.iter().partition(|k| k.is_workload());

    self.log_info(&format!("Start deleting {} resources", keys.len()));
    let mut deleted = 0;
    for key in others.into_iter().chain(workloads) {
      match self.appliers.delete(key).await {
        Ok(()) => {
          deleted += 1;
          self.log_info(&format!("- deleted resource: {}", key.readable_string()));
        }
        Err(err) if err.is_not_found() => {
          self.log_info(&format!("- no resource {} to delete", key.readable_string()));
        }
        Err(err @ ApplyError::NoRoute(_)) => return Err(err.into()),
        Err(err) => {
          self.log_error(&format!("- unable to delete resource {}: {}", key.readable_string(), err));
        }
      }
    }
    self.log_success(&format!("Successfully deleted {} resources", deleted));
    Ok(())
  }

  /// Delete live resources of the application that `applied` no longer
  /// contains.
  async fn prune(&self, applied: &[Manifest]) -> Result<(), K8sStageError> {
    self.log_info("Start finding all running resources but no longer defined in Git");
    // Give the live state a moment to catch up with what was just applied.
    tokio::time::sleep(PRUNE_DEBOUNCE).await;

    let namespace = self.namespace();
    let applied: BTreeSet<ResourceKey> = applied.iter().map(|m| m.key.with_default_namespace(namespace)).collect();

    let live: Vec<ResourceKey> = match &self.input.live {
      Some(getter) => getter
        .get_app_live_manifests(&self.input.deployment.app.id)
        .iter()
        .map(|m| resource_key_from_live(m).with_default_namespace(namespace))
        .collect(),
      None if self.input.deployment.running_commit.is_empty() => Vec::new(),
      None => self
        .load_running_manifests()
        .await?
        .iter()
        .map(|m| m.key.with_default_namespace(namespace))
        .collect(),
    };

    let removed: Vec<ResourceKey> = live
      .into_iter()
      .collect::<BTreeSet<_>>()
      .into_iter()
      .filter(|k| !applied.contains(k))
      .collect();
    if removed.is_empty() {
      self.log_info("There are no live resources should be removed");
      return Ok(());
    }
    self.log_info(&format!(
      "Found {} live resources that are no longer defined in Git",
      removed.len()
    ));
    self.delete_resources(&removed).await
  }

  /// Delete the resources a variant stage recorded under `metadata_key`.
  async fn remove_recorded_resources(&self, metadata_key: &str, variant: &str) -> Result<(), K8sStageError> {
    let Some(value) = self.input.metadata.shared(metadata_key).await else {
      return Err(failed(format!(
        "Unable to determine the applied {} resources",
        variant.to_uppercase()
      )));
    };
    let keys = decode_resource_keys(&value);
    self.delete_resources(&keys).await
  }

  /// Remember the resources of a variant for the matching clean stage.
  async fn record_resources(&self, metadata_key: &str, manifests: &[Manifest]) -> Result<(), K8sStageError> {
    let value = manifests
      .iter()
      .map(|m| m.key.to_string())
      .collect::<Vec<_>>()
      .join(",");
    self.input.metadata.put_shared(metadata_key, &value).await?;
    Ok(())
  }
}

fn decode_resource_keys(value: &str) -> Vec<ResourceKey> {
  value
    .split(',')
    .filter(|s| !s.is_empty())
    .filter_map(|s| match s.parse::<ResourceKey>() {
      Ok(key) => Some(key),
      Err(err) => {
        debug!(key = s, error = %err, "ignored malformed resource key");
        None
      }
    })
    .collect()
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::config::ApplicationKind;
  use crate::executor::testing::{Fixture, fixture, write_app};
  use crate::executor::Stage;
  use crate::config::PipelineStage;

  pub const APP_CONFIG: &str = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";

  pub const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 4
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: ghcr.io/acme/web:v2
"#;

  pub const SERVICE: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
  ports:
    - port: 80
      targetPort: 8080
"#;

  /// Fixture for a Kubernetes app with `config` and `manifests` at the head
  /// commit.
  pub fn k8s_fixture(dir: &Path, config: &str, manifests: &[(&str, &str)], stage: Stage) -> Fixture {
    let mut files = vec![("app.pipecd.yaml", config)];
    files.extend_from_slice(manifests);
    write_app(dir, &files);
    fixture(ApplicationKind::Kubernetes, dir, stage)
  }

  #[test]
  fn malformed_keys_are_skipped() {
    let keys = decode_resource_keys("apps/v1:Deployment:default:web-canary,,broken");
    assert_eq!(keys, vec![ResourceKey::new("apps/v1", "Deployment", "default", "web-canary")]);
  }

  #[tokio::test]
  async fn unsupported_stage_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fx = k8s_fixture(
      dir.path(),
      APP_CONFIG,
      &[],
      Stage::new(0, PipelineStage::new(StageName::LambdaSync)),
    );
    assert_eq!(execute(&fx.input).await, StageStatus::Failure);
    assert!(fx.log.text().contains("Unsupported stage LambdaSync"));
  }

  #[tokio::test]
  async fn missing_app_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_app(dir.path(), &[]);
    let fx = fixture(
      ApplicationKind::Kubernetes,
      dir.path(),
      Stage::new(0, PipelineStage::new(StageName::K8sSync)),
    );
    assert_eq!(execute(&fx.input).await, StageStatus::Failure);
    assert!(fx.log.text().contains("Failed while loading application config"));
  }

  #[tokio::test]
  async fn deletion_runs_workloads_last_and_skips_missing() {
    let dir = tempfile::tempdir().unwrap();
    let fx = k8s_fixture(
      dir.path(),
      APP_CONFIG,
      &[],
      Stage::new(0, PipelineStage::new(StageName::K8sCanaryClean)),
    );
    let applier = fx.clients.applier("default");
    let missing = ResourceKey::new("v1", "ConfigMap", "default", "web-config-canary");
    applier.missing.lock().push(missing);

    fx.input
      .metadata
      .put_shared(
        crate::consts::CANARY_RESOURCES_KEY,
        "apps/v1:Deployment:default:web-canary,v1:Service:default:web-canary,v1:ConfigMap:default:web-config-canary",
      )
      .await
      .unwrap();

    assert_eq!(execute(&fx.input).await, StageStatus::Success);
    assert_eq!(
      applier.calls(),
      vec![
        "delete v1:Service:default:web-canary",
        "delete v1:ConfigMap:default:web-config-canary",
        "delete apps/v1:Deployment:default:web-canary",
      ]
    );
    assert!(fx.log.text().contains("no resource name=\"web-config-canary\""));
  }
}
