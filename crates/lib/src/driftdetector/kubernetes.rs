//! Drift check of Kubernetes applications.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use tracing::info;

use super::{
  AppChecker, DriftError, SourcePreprocessor, SyncState, diff_header, filter_ignoring_manifests, parse_ignore_fields,
};
use crate::chartrepo::ChartRepos;
use crate::config::{ApplicationRef, HelmChartRepository, PipedRepository, load_application_config};
use crate::diff::DiffOptions;
use crate::git::{Checkout, GitClient};
use crate::kubernetes::{ApiVersionKind, DiffListResult, DiffRenderOptions, Loader, LoaderInput, Manifest, diff_list};
use crate::livestate::kubernetes::Getter;
use crate::toolregistry::Registry;

const MAX_RENDERED_CHANGES: usize = 3;
const CACHE_CAPACITY: u64 = 500;

/// What a commit declares for one application.
#[derive(Debug)]
struct HeadState {
  manifests: Vec<Manifest>,
  ignore_fields: Vec<String>,
}

pub struct KubernetesChecker {
  getter: Arc<dyn Getter>,
  git: Arc<dyn GitClient>,
  registry: Arc<Registry>,
  chart_repos: Option<Arc<ChartRepos>>,
  chart_repositories: Vec<HelmChartRepository>,
  preprocessor: Option<Arc<dyn SourcePreprocessor>>,
  cache: Cache<(String, String), Arc<HeadState>>,
}

impl KubernetesChecker {
  pub fn new(getter: Arc<dyn Getter>, git: Arc<dyn GitClient>, registry: Arc<Registry>) -> Self {
    Self {
      getter,
      git,
      registry,
      chart_repos: None,
      chart_repositories: Vec::new(),
      preprocessor: None,
      cache: Cache::new(CACHE_CAPACITY),
    }
  }

  pub fn with_chart_repos(mut self, chart_repos: Arc<ChartRepos>, configs: Vec<HelmChartRepository>) -> Self {
    self.chart_repos = Some(chart_repos);
    self.chart_repositories = configs;
    self
  }

  pub fn with_preprocessor(mut self, preprocessor: Arc<dyn SourcePreprocessor>) -> Self {
    self.preprocessor = Some(preprocessor);
    self
  }

  async fn load_head(
    &self,
    app: &ApplicationRef,
    repo: &PipedRepository,
    checkout: &Checkout,
  ) -> Result<Arc<HeadState>, DriftError> {
    let key = (app.id.clone(), checkout.commit.clone());
    if let Some(head) = self.cache.get(&key).await {
      return Ok(head);
    }

    let mut repo_dir: PathBuf = checkout.dir.clone();
    let config = load_application_config(&repo_dir.join(&app.path), app.config_filename())?;
    let mut spec = config.kubernetes_spec()?;
    if let Some(chart) = spec.input.helm_chart.as_mut() {
      if !chart.repository.is_empty() {
        chart.insecure = self
          .chart_repositories
          .iter()
          .any(|r| r.name == chart.repository && r.insecure);
      }
    }

    // Preprocessing rewrites files, so it works on a private clone.
    let mut _workspace = None;
    if let Some(preprocessor) = self.preprocessor.as_ref().filter(|_| spec.generic.mutates_sources()) {
      let dir = tempfile::Builder::new()
        .prefix("detector-git-processing")
        .tempdir()
        .map_err(DriftError::TempDir)?;
      let dest = dir.path().join("repo");
      GitClient::clone_into(&*self.git, &repo.remote, &checkout.commit, &dest).await?;
      preprocessor.process(&dest.join(&app.path), &spec.generic).await?;
      repo_dir = dest;
      _workspace = Some(dir);
    }

    let input = LoaderInput {
      app_name: app.name.clone(),
      app_dir: repo_dir.join(&app.path),
      repo_dir,
      config_filename: app.config_filename().to_string(),
      input: spec.input.clone(),
    };
    let mut loader = Loader::new(input, self.registry.clone()).with_git(self.git.clone());
    if let Some(chart_repos) = &self.chart_repos {
      loader = loader.with_chart_repos(chart_repos.clone());
    }
    let manifests = loader.load_manifests().await?;

    let head = Arc::new(HeadState {
      manifests,
      ignore_fields: spec.generic.ignore_fields().to_vec(),
    });
    self.cache.insert(key, head.clone()).await;
    Ok(head)
  }
}

/// Options every drift comparison uses.
pub fn drift_diff_options() -> DiffOptions {
  DiffOptions::default()
    .with_equate_empty()
    .with_ignore_adding_map_keys()
    .with_compare_number_and_numeric_string()
}

/// Sync state from the result of `diff_list(live, head)`.
pub async fn make_sync_state(result: &DiffListResult, commit: &str) -> SyncState {
  if result.no_change() {
    return SyncState::synced();
  }
  let short_reason = format!(
    "There are {} manifests not synced ({} adds, {} deletes, {} changes)",
    result.total_count(),
    result.adds.len(),
    result.deletes.len(),
    result.changes.len()
  );
  let mut long_reason = diff_header(commit);
  let details = result
    .render(&DiffRenderOptions {
      mask_secret: true,
      mask_config_map: true,
      max_changed_manifests: MAX_RENDERED_CHANGES,
      use_diff_command: false,
    })
    .await;
  long_reason.push_str(&details);
  SyncState::out_of_sync(short_reason, long_reason)
}

#[async_trait]
impl AppChecker for KubernetesChecker {
  async fn check_application(
    &self,
    app: &ApplicationRef,
    repo: &PipedRepository,
    checkout: &Checkout,
  ) -> Result<SyncState, DriftError> {
    let head = self.load_head(app, repo, checkout).await?;

    // Types nobody watches have no live counterpart to compare with.
    let watching: HashSet<ApiVersionKind> = self.getter.watching_kinds().into_iter().collect();
    let head_manifests: Vec<Manifest> = head
      .manifests
      .iter()
      .filter(|m| watching.is_empty() || watching.contains(&m.key.api_version_kind()))
      .cloned()
      .collect();
    let head_manifests = filter_ignoring_manifests(head_manifests);
    info!(count = head_manifests.len(), commit = %checkout.commit, "loaded head manifests");

    let live_manifests = filter_ignoring_manifests(self.getter.get_app_live_manifests(&app.id));
    info!(count = live_manifests.len(), "loaded live manifests");

    let ignored = parse_ignore_fields(&head.ignore_fields);
    let result = diff_list(&live_manifests, &head_manifests, &ignored, &drift_diff_options());
    Ok(make_sync_state(&result, &checkout.commit).await)
  }
}
