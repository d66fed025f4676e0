//! Drift detection: the state defined in git against the live state.
//!
//! A [`Detector`] runs per platform provider. On every tick it groups the
//! provider's applications by repository, brings each repository to its
//! branch head and asks the provider's [`AppChecker`] for a sync state,
//! which is then posted through the [`Reporter`].

pub mod kubernetes;
pub mod lambda;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{ApplicationRef, ConfigError, GenericApplicationSpec, PipedRepository, PipedSpec};
use crate::consts::{ANNOTATION_IGNORE_DRIFT_DETECTION, DEFAULT_DRIFT_DETECTION_INTERVAL, IGNORE_DRIFT_DETECTION_TRUE};
use crate::git::{Checkout, GitClient, GitError};
use crate::kubernetes::{LoaderError, Manifest};
use crate::lambda::FunctionManifestError;

pub use self::kubernetes::KubernetesChecker;
pub use self::lambda::LambdaChecker;

#[derive(Debug, Error)]
pub enum DriftError {
  #[error("repository {0} was not found in piped configuration")]
  UnknownRepository(String),

  #[error(transparent)]
  Git(#[from] GitError),

  #[error("failed to load application configuration: {0}")]
  Config(#[from] ConfigError),

  #[error("failed to load manifests: {0}")]
  Loader(#[from] LoaderError),

  #[error("failed to load function manifest: {0}")]
  FunctionManifest(#[from] FunctionManifestError),

  #[error("failed to process source files: {0}")]
  Preprocess(String),

  #[error("failed to prepare a temporary directory: {0}")]
  TempDir(#[source] std::io::Error),

  #[error("failed to get the live state of application {0}")]
  NoLiveState(String),

  #[error("failed to report sync state: {0}")]
  Report(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
  Synced,
  OutOfSync,
}

impl std::fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      SyncStatus::Synced => "SYNCED",
      SyncStatus::OutOfSync => "OUT_OF_SYNC",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
  pub status: SyncStatus,
  pub short_reason: String,
  pub long_reason: String,
  /// Unix seconds.
  pub timestamp: u64,
}

fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or_default()
}

impl SyncState {
  pub fn synced() -> Self {
    Self {
      status: SyncStatus::Synced,
      short_reason: String::new(),
      long_reason: String::new(),
      timestamp: now_unix(),
    }
  }

  pub fn out_of_sync(short_reason: impl Into<String>, long_reason: impl Into<String>) -> Self {
    Self {
      status: SyncStatus::OutOfSync,
      short_reason: short_reason.into(),
      long_reason: long_reason.into(),
      timestamp: now_unix(),
    }
  }
}

/// Where sync states go. The control plane implements this in production.
#[async_trait]
pub trait Reporter: Send + Sync {
  async fn report_application_sync_state(&self, app_id: &str, state: &SyncState) -> Result<(), DriftError>;
}

/// Reporter that writes states to the process log and keeps the latest one
/// per application.
#[derive(Debug, Default)]
pub struct LoggingReporter {
  states: Mutex<HashMap<String, SyncState>>,
}

impl LoggingReporter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn last_state(&self, app_id: &str) -> Option<SyncState> {
    self.states.lock().get(app_id).cloned()
  }
}

#[async_trait]
impl Reporter for LoggingReporter {
  async fn report_application_sync_state(&self, app_id: &str, state: &SyncState) -> Result<(), DriftError> {
    match state.status {
      SyncStatus::Synced => info!(app_id = %app_id, "application is synced"),
      SyncStatus::OutOfSync => {
        warn!(app_id = %app_id, reason = %state.short_reason, "application is out of sync");
        debug!(app_id = %app_id, "{}", state.long_reason);
      }
    }
    self.states.lock().insert(app_id.to_string(), state.clone());
    Ok(())
  }
}

/// Rewrites application sources before loading, e.g. secret decryption or
/// file attachment. Runs against a private copy of the repository.
#[async_trait]
pub trait SourcePreprocessor: Send + Sync {
  async fn process(&self, app_dir: &Path, spec: &GenericApplicationSpec) -> Result<(), DriftError>;
}

/// Computes the sync state of one application at a checked-out commit.
#[async_trait]
pub trait AppChecker: Send + Sync {
  async fn check_application(
    &self,
    app: &ApplicationRef,
    repo: &PipedRepository,
    checkout: &Checkout,
  ) -> Result<SyncState, DriftError>;
}

/// Parse `apiVersion:kind:namespace:name#path` entries into paths keyed by
/// resource key. Malformed entries are skipped.
pub fn parse_ignore_fields(fields: &[String]) -> HashMap<String, Vec<String>> {
  let mut out: HashMap<String, Vec<String>> = HashMap::new();
  for field in fields {
    match field.split_once('#') {
      Some((key, path)) if !key.is_empty() && !path.is_empty() => {
        out.entry(key.to_string()).or_default().push(path.to_string());
      }
      _ => warn!(field = %field, "ignoring malformed drift detection ignore field"),
    }
  }
  out
}

/// Drop manifests annotated with `pipecd.dev/ignore-drift-detection: true`.
pub fn filter_ignoring_manifests(manifests: Vec<Manifest>) -> Vec<Manifest> {
  manifests
    .into_iter()
    .filter(|m| m.annotation(ANNOTATION_IGNORE_DRIFT_DETECTION) != Some(IGNORE_DRIFT_DETECTION_TRUE))
    .collect()
}

pub(crate) fn short_commit(commit: &str) -> &str {
  commit.get(..7).unwrap_or(commit)
}

/// First lines of every out-of-sync long reason.
pub(crate) fn diff_header(commit: &str) -> String {
  format!(
    "Diff between the defined state in Git at commit {} and actual live state:\n\n--- Actual   (LiveState)\n+++ Expected (Git)\n\n",
    short_commit(commit)
  )
}

/// Periodic drift check of one platform provider's applications.
pub struct Detector {
  provider: String,
  apps: Vec<ApplicationRef>,
  repos: Vec<PipedRepository>,
  git: Arc<dyn GitClient>,
  reporter: Arc<dyn Reporter>,
  checker: Arc<dyn AppChecker>,
  interval: Duration,
}

impl Detector {
  pub fn new(
    provider: impl Into<String>,
    spec: &PipedSpec,
    git: Arc<dyn GitClient>,
    reporter: Arc<dyn Reporter>,
    checker: Arc<dyn AppChecker>,
  ) -> Self {
    let provider = provider.into();
    let apps = spec
      .applications
      .iter()
      .filter(|a| a.platform_provider == provider)
      .cloned()
      .collect();
    Self {
      provider,
      apps,
      repos: spec.repositories.clone(),
      git,
      reporter,
      checker,
      interval: if spec.drift_detection_interval.is_zero() {
        DEFAULT_DRIFT_DETECTION_INTERVAL
      } else {
        spec.drift_detection_interval
      },
    }
  }

  pub fn provider_name(&self) -> &str {
    &self.provider
  }

  /// Check on every tick until cancelled. Ticks never overlap.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(provider = %self.provider, apps = self.apps.len(), "start running drift detector");
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!(provider = %self.provider, "drift detector has been stopped");
          return;
        }
        _ = ticker.tick() => {}
      }
      let span = info_span!("drift_check", provider = %self.provider);
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = self.check().instrument(span) => {}
      }
    }
  }

  fn grouped_applications(&self) -> BTreeMap<&str, Vec<&ApplicationRef>> {
    let mut grouped: BTreeMap<&str, Vec<&ApplicationRef>> = BTreeMap::new();
    for app in &self.apps {
      grouped.entry(app.repo_id.as_str()).or_default().push(app);
    }
    grouped
  }

  /// One pass over every application. Failures are logged per application.
  pub async fn check(&self) {
    for (repo_id, apps) in self.grouped_applications() {
      let Some(repo) = self.repos.iter().find(|r| r.repo_id == repo_id) else {
        error!(repo_id = %repo_id, "{}", DriftError::UnknownRepository(repo_id.to_string()));
        continue;
      };
      let checkout = match self.git.sync(&repo.repo_id, &repo.remote, &repo.branch).await {
        Ok(checkout) => checkout,
        Err(e) => {
          error!(repo_id = %repo_id, error = %e, "failed to update repository branch");
          continue;
        }
      };

      for app in apps {
        let span = info_span!("check_application", app_id = %app.id, commit = %short_commit(&checkout.commit));
        if let Err(e) = self.check_one(app, repo, &checkout).instrument(span).await {
          error!(app_id = %app.id, error = %e, "failed to check application");
        }
      }
    }
  }

  async fn check_one(&self, app: &ApplicationRef, repo: &PipedRepository, checkout: &Checkout) -> Result<(), DriftError> {
    let state = self.checker.check_application(app, repo, checkout).await?;
    self.reporter.report_application_sync_state(&app.id, &state).await
  }
}

#[cfg(test)]
mod tests {
  use tracing_test::traced_test;

  use super::*;
  use crate::kubernetes::manifest::parse_manifests;

  #[test]
  fn parses_ignore_fields() {
    let fields = vec![
      "apps/v1:Deployment:default:web#spec.replicas".to_string(),
      "apps/v1:Deployment:default:web#spec.template.metadata.annotations".to_string(),
      "v1:Service:default:web".to_string(),
      "#spec".to_string(),
    ];
    let parsed = parse_ignore_fields(&fields);
    assert_eq!(parsed.len(), 1);
    assert_eq!(
      parsed["apps/v1:Deployment:default:web"],
      vec!["spec.replicas", "spec.template.metadata.annotations"]
    );
  }

  #[test]
  fn filters_ignored_manifests() {
    let manifests = parse_manifests(
      r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: a
  annotations:
    pipecd.dev/ignore-drift-detection: "true"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: b
  annotations:
    pipecd.dev/ignore-drift-detection: "false"
"#,
    )
    .unwrap();
    let kept = filter_ignoring_manifests(manifests);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].name(), "b");
  }

  #[test]
  fn header_uses_short_commit() {
    let header = diff_header("0123456789abcdef");
    assert!(header.starts_with("Diff between the defined state in Git at commit 0123456 and actual live state:"));
    assert!(header.ends_with("--- Actual   (LiveState)\n+++ Expected (Git)\n\n"));
    assert_eq!(short_commit("abc"), "abc");
  }

  #[tokio::test]
  async fn logging_reporter_keeps_last_state() {
    let reporter = LoggingReporter::new();
    reporter
      .report_application_sync_state("app-1", &SyncState::out_of_sync("drifted", "details"))
      .await
      .unwrap();
    reporter
      .report_application_sync_state("app-1", &SyncState::synced())
      .await
      .unwrap();
    assert_eq!(reporter.last_state("app-1").unwrap().status, SyncStatus::Synced);
    assert!(reporter.last_state("app-2").is_none());
  }

  #[tokio::test]
  #[traced_test]
  async fn logging_reporter_warns_on_drift() {
    let reporter = LoggingReporter::new();
    reporter
      .report_application_sync_state("app-7", &SyncState::out_of_sync("There are 2 manifests not synced", "details"))
      .await
      .unwrap();
    assert!(logs_contain("application is out of sync"));
    assert!(logs_contain("There are 2 manifests not synced"));
  }
}
