//! Deployment stage execution.
//!
//! One [`execute`] call runs one stage of one deployment. Stages read what
//! they need from an [`Input`] bundle, write user-facing progress through a
//! [`LogPersister`] and leave state for later stages in a [`MetadataStore`].
//! Errors never escape a stage: they end up as a log line and a
//! [`StageStatus::Failure`].

pub mod kubernetes;
pub mod lambda;
pub mod scriptrun;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use crate::chartrepo::ChartRepos;
use crate::config::{
  ApplicationKind, ApplicationRef, ConfigError, KubernetesDeploymentInput, PipedSpec, PipelineStage,
  PlatformProviderConfig, StageName,
};
use crate::git::GitClient;
use crate::kubernetes::{Applier, KubectlApplier, Manifest};
use crate::lambda::{AwsLambdaClient, LambdaClient};
use crate::livestate::kubernetes::Getter;
use crate::metrics::record_stage_execution;
use crate::toolregistry::Registry;

const MANIFESTS_CACHE_CAPACITY: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
  Success,
  Failure,
  Cancelled,
}

impl StageStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      StageStatus::Success => "SUCCESS",
      StageStatus::Failure => "FAILURE",
      StageStatus::Cancelled => "CANCELLED",
    }
  }
}

impl std::fmt::Display for StageStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<bool> for StageStatus {
  fn from(ok: bool) -> Self {
    if ok { StageStatus::Success } else { StageStatus::Failure }
  }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
  #[error("platform provider {0} was not found in piped configuration")]
  UnknownProvider(String),

  #[error("platform provider {name} is not a {expected} provider")]
  ProviderKind { name: String, expected: &'static str },

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("failed to build platform client: {0}")]
  Client(String),

  #[error("failed to store deployment metadata: {0}")]
  Metadata(String),
}

/// A stage of a planned deployment.
#[derive(Debug, Clone)]
pub struct Stage {
  pub id: String,
  pub index: usize,
  /// Rollback stages only run once the deployment has failed or been cancelled.
  pub rollback: bool,
  /// Ids of stages this one depends on.
  pub requires: Vec<String>,
  /// Values fixed when the stage was planned.
  pub metadata: BTreeMap<String, String>,
  pub config: PipelineStage,
}

impl Stage {
  pub fn new(index: usize, config: PipelineStage) -> Self {
    let id = if config.id.is_empty() {
      format!("stage-{}", index)
    } else {
      config.id.clone()
    };
    Self {
      id,
      index,
      rollback: false,
      requires: Vec::new(),
      metadata: BTreeMap::new(),
      config,
    }
  }

  /// A rollback stage with default options.
  pub fn rollback(index: usize, name: StageName) -> Self {
    let mut stage = Self::new(index, PipelineStage::new(name));
    stage.id = format!("{}-{}", name, index);
    stage.rollback = true;
    stage
  }

  pub fn name(&self) -> StageName {
    self.config.name
  }
}

/// The deployment a stage belongs to.
#[derive(Debug, Clone)]
pub struct Deployment {
  pub id: String,
  pub app: ApplicationRef,
  pub summary: String,
  /// Commit being deployed.
  pub commit: String,
  /// Commit of the last successful deployment, empty on the first one.
  pub running_commit: String,
  /// Checkout at `commit`.
  pub repo_dir: PathBuf,
  /// Checkout at `running_commit`.
  pub running_repo_dir: Option<PathBuf>,
  pub repository_url: String,
  /// Unix seconds.
  pub triggered_at: u64,
}

impl Deployment {
  pub fn app_dir(&self) -> PathBuf {
    self.repo_dir.join(&self.app.path)
  }

  pub fn running_app_dir(&self) -> Option<PathBuf> {
    self.running_repo_dir.as_ref().map(|d| d.join(&self.app.path))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
  Info,
  Success,
  Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
  pub severity: LogSeverity,
  pub message: String,
}

/// Where stage progress is written for users to read.
pub trait LogPersister: Send + Sync {
  fn append(&self, severity: LogSeverity, message: &str);

  fn info(&self, message: &str) {
    self.append(LogSeverity::Info, message);
  }

  fn success(&self, message: &str) {
    self.append(LogSeverity::Success, message);
  }

  fn error(&self, message: &str) {
    self.append(LogSeverity::Error, message);
  }
}

/// Keeps the lines of one stage in memory and mirrors them to tracing.
#[derive(Debug, Default)]
pub struct StageLog {
  lines: Mutex<Vec<LogLine>>,
}

impl StageLog {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn lines(&self) -> Vec<LogLine> {
    self.lines.lock().clone()
  }

  pub fn text(&self) -> String {
    self
      .lines
      .lock()
      .iter()
      .map(|l| l.message.as_str())
      .collect::<Vec<_>>()
      .join("\n")
  }
}

impl LogPersister for StageLog {
  fn append(&self, severity: LogSeverity, message: &str) {
    match severity {
      LogSeverity::Error => error!(target: "piped::stage", "{}", message),
      _ => info!(target: "piped::stage", "{}", message),
    }
    self.lines.lock().push(LogLine {
      severity,
      message: message.to_string(),
    });
  }
}

/// Deployment-scoped key/value storage shared by its stages.
#[async_trait]
pub trait MetadataStore: Send + Sync {
  async fn shared(&self, key: &str) -> Option<String>;

  async fn put_shared(&self, key: &str, value: &str) -> Result<(), ExecutorError>;

  async fn stage(&self, stage_id: &str, key: &str) -> Option<String>;

  async fn put_stage(&self, stage_id: &str, values: BTreeMap<String, String>) -> Result<(), ExecutorError>;
}

#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
  shared: RwLock<BTreeMap<String, String>>,
  stages: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl InMemoryMetadataStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn stage_values(&self, stage_id: &str) -> BTreeMap<String, String> {
    self.stages.read().get(stage_id).cloned().unwrap_or_default()
  }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
  async fn shared(&self, key: &str) -> Option<String> {
    self.shared.read().get(key).cloned()
  }

  async fn put_shared(&self, key: &str, value: &str) -> Result<(), ExecutorError> {
    self.shared.write().insert(key.to_string(), value.to_string());
    Ok(())
  }

  async fn stage(&self, stage_id: &str, key: &str) -> Option<String> {
    self.stages.read().get(stage_id).and_then(|m| m.get(key)).cloned()
  }

  async fn put_stage(&self, stage_id: &str, values: BTreeMap<String, String>) -> Result<(), ExecutorError> {
    self
      .stages
      .write()
      .entry(stage_id.to_string())
      .or_default()
      .extend(values);
    Ok(())
  }
}

/// Builds the clients stages use to reach a platform provider.
#[async_trait]
pub trait PlatformClients: Send + Sync {
  fn kubernetes_applier(
    &self,
    provider: &str,
    input: &KubernetesDeploymentInput,
  ) -> Result<Arc<dyn Applier>, ExecutorError>;

  async fn lambda_client(&self, provider: &str) -> Result<Arc<dyn LambdaClient>, ExecutorError>;
}

/// [`PlatformClients`] for the providers declared in the piped config.
pub struct ProviderClients {
  piped: Arc<PipedSpec>,
  registry: Arc<Registry>,
}

impl ProviderClients {
  pub fn new(piped: Arc<PipedSpec>, registry: Arc<Registry>) -> Self {
    Self { piped, registry }
  }

  fn provider(&self, name: &str) -> Result<&PlatformProviderConfig, ExecutorError> {
    self
      .piped
      .find_platform_provider(name)
      .map(|p| &p.config)
      .ok_or_else(|| ExecutorError::UnknownProvider(name.to_string()))
  }
}

#[async_trait]
impl PlatformClients for ProviderClients {
  fn kubernetes_applier(
    &self,
    provider: &str,
    input: &KubernetesDeploymentInput,
  ) -> Result<Arc<dyn Applier>, ExecutorError> {
    match self.provider(provider)? {
      PlatformProviderConfig::Kubernetes(cfg) => Ok(Arc::new(KubectlApplier::new(
        input.clone(),
        cfg.clone(),
        self.registry.clone(),
      ))),
      _ => Err(ExecutorError::ProviderKind {
        name: provider.to_string(),
        expected: "Kubernetes",
      }),
    }
  }

  async fn lambda_client(&self, provider: &str) -> Result<Arc<dyn LambdaClient>, ExecutorError> {
    match self.provider(provider)? {
      PlatformProviderConfig::Lambda(cfg) => {
        let client = AwsLambdaClient::new(cfg)
          .await
          .map_err(|e| ExecutorError::Client(e.to_string()))?;
        Ok(Arc::new(client))
      }
      _ => Err(ExecutorError::ProviderKind {
        name: provider.to_string(),
        expected: "Lambda",
      }),
    }
  }
}

/// Loaded manifests per `(application id, commit)`, shared by the stages of
/// every deployment.
pub type ManifestsCache = Cache<(String, String), Arc<Vec<Manifest>>>;

pub fn new_manifests_cache() -> ManifestsCache {
  Cache::new(MANIFESTS_CACHE_CAPACITY)
}

/// Everything a stage runs with.
#[derive(Clone)]
pub struct Input {
  pub deployment: Deployment,
  pub stage: Stage,
  pub piped_id: String,
  pub log: Arc<dyn LogPersister>,
  pub metadata: Arc<dyn MetadataStore>,
  pub clients: Arc<dyn PlatformClients>,
  pub registry: Arc<Registry>,
  pub git: Option<Arc<dyn GitClient>>,
  pub chart_repos: Option<Arc<ChartRepos>>,
  pub manifests_cache: ManifestsCache,
  /// Live resources of the application's cluster, used when pruning.
  pub live: Option<Arc<dyn Getter>>,
}

/// Run one stage to completion or until `cancel` fires.
///
/// Cancelling drops the running stage, which kills any child process it
/// started.
pub async fn execute(input: &Input, cancel: &CancellationToken) -> StageStatus {
  let span = info_span!(
    "stage",
    deployment = %input.deployment.id,
    app = %input.deployment.app.id,
    stage = %input.stage.name(),
  );

  let run = async {
    info!(stage_id = %input.stage.id, "start executing stage");
    match (input.stage.name(), input.deployment.app.kind) {
      (StageName::ScriptRun, _) => scriptrun::run(input, cancel).await,
      (StageName::ScriptRunRollback, _) => scriptrun::rollback(input, cancel).await,
      (_, ApplicationKind::Kubernetes) => kubernetes::execute(input).await,
      (_, ApplicationKind::Lambda) => lambda::execute(input).await,
    }
  };

  let status = tokio::select! {
    biased;
    _ = cancel.cancelled() => {
      input.log.info(&format!("Stage {} was cancelled", input.stage.name()));
      StageStatus::Cancelled
    }
    status = run.instrument(span.clone()) => status,
  };

  span.in_scope(|| info!(%status, "finished executing stage"));
  record_stage_execution(input.stage.name().as_str(), status.as_str());
  status
}

#[cfg(test)]
pub(crate) mod testing {
  //! Shared fixtures for stage tests.

  use std::path::Path;

  use super::*;
  use crate::kubernetes::{KubectlError, ResourceKey};
  use crate::lambda::fake::FakeLambdaClient;

  /// Records every call and keeps applied objects by key.
  #[derive(Default)]
  pub struct FakeApplier {
    pub calls: Mutex<Vec<String>>,
    pub applied: Mutex<BTreeMap<ResourceKey, Manifest>>,
    /// Keys whose deletion reports not found.
    pub missing: Mutex<Vec<ResourceKey>>,
    /// Keys whose deletion fails.
    pub broken: Mutex<Vec<ResourceKey>>,
  }

  impl FakeApplier {
    pub fn calls(&self) -> Vec<String> {
      self.calls.lock().clone()
    }

    pub fn applied(&self, key: &str) -> Option<Manifest> {
      let key: ResourceKey = key.parse().ok()?;
      self.applied.lock().get(&key).cloned()
    }
  }

  #[async_trait]
  impl Applier for FakeApplier {
    async fn apply_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError> {
      self.calls.lock().push(format!("apply {}", manifest.key));
      self.applied.lock().insert(manifest.key.clone(), manifest.clone());
      Ok(())
    }

    async fn create_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError> {
      self.calls.lock().push(format!("create {}", manifest.key));
      self.applied.lock().insert(manifest.key.clone(), manifest.clone());
      Ok(())
    }

    async fn replace_manifest(&self, manifest: &Manifest) -> Result<(), KubectlError> {
      self.calls.lock().push(format!("replace {}", manifest.key));
      if !self.applied.lock().contains_key(&manifest.key) {
        return Err(KubectlError::NotFound(manifest.key.to_string()));
      }
      self.applied.lock().insert(manifest.key.clone(), manifest.clone());
      Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), KubectlError> {
      self.calls.lock().push(format!("delete {}", key));
      if self.missing.lock().contains(key) {
        return Err(KubectlError::NotFound(key.to_string()));
      }
      if self.broken.lock().contains(key) {
        return Err(KubectlError::Command {
          verb: "delete",
          output: "connection refused".to_string(),
        });
      }
      self.applied.lock().remove(key);
      Ok(())
    }
  }

  /// One [`FakeApplier`] per provider name and one shared Lambda fake.
  #[derive(Default)]
  pub struct FakeClients {
    pub appliers: Mutex<HashMap<String, Arc<FakeApplier>>>,
    pub lambda: Arc<FakeLambdaClient>,
  }

  impl FakeClients {
    pub fn applier(&self, provider: &str) -> Arc<FakeApplier> {
      self.appliers.lock().entry(provider.to_string()).or_default().clone()
    }
  }

  #[async_trait]
  impl PlatformClients for FakeClients {
    fn kubernetes_applier(
      &self,
      provider: &str,
      _input: &KubernetesDeploymentInput,
    ) -> Result<Arc<dyn Applier>, ExecutorError> {
      if provider == "unknown" {
        return Err(ExecutorError::UnknownProvider(provider.to_string()));
      }
      Ok(self.applier(provider))
    }

    async fn lambda_client(&self, _provider: &str) -> Result<Arc<dyn LambdaClient>, ExecutorError> {
      Ok(self.lambda.clone())
    }
  }

  pub struct Fixture {
    pub log: Arc<StageLog>,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub clients: Arc<FakeClients>,
    pub input: Input,
  }

  /// Input for `stage` of application `app-1` rooted at `repo_dir`.
  pub fn fixture(kind: ApplicationKind, repo_dir: &Path, stage: Stage) -> Fixture {
    let log = Arc::new(StageLog::new());
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let clients = Arc::new(FakeClients::default());
    let registry = Arc::new(Registry::empty(repo_dir.join(".bin")).unwrap());
    let deployment = Deployment {
      id: "deploy-1".to_string(),
      app: ApplicationRef {
        id: "app-1".to_string(),
        name: "web".to_string(),
        kind,
        platform_provider: "default".to_string(),
        repo_id: "repo".to_string(),
        path: "app".to_string(),
        config_filename: String::new(),
      },
      summary: "deploy web".to_string(),
      commit: "0123456789abcdef".to_string(),
      running_commit: String::new(),
      repo_dir: repo_dir.to_path_buf(),
      running_repo_dir: None,
      repository_url: "https://github.com/acme/deploys".to_string(),
      triggered_at: 1_700_000_000,
    };
    let input = Input {
      deployment,
      stage,
      piped_id: "piped-1".to_string(),
      log: log.clone(),
      metadata: metadata.clone(),
      clients: clients.clone(),
      registry,
      git: None,
      chart_repos: None,
      manifests_cache: new_manifests_cache(),
      live: None,
    };
    Fixture {
      log,
      metadata,
      clients,
      input,
    }
  }

  /// Write `files` under `<root>/app`.
  pub fn write_app(root: &Path, files: &[(&str, &str)]) {
    let dir = root.join("app");
    std::fs::create_dir_all(&dir).unwrap();
    for (name, content) in files {
      std::fs::write(dir.join(name), content).unwrap();
    }
  }

  pub fn stage_with<T: Serialize>(name: StageName, options: &T) -> Stage {
    Stage::new(0, PipelineStage::new(name).with_options(options))
  }
}
