//! Drift check of Lambda applications.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use tracing::info;

use super::kubernetes::drift_diff_options;
use super::{AppChecker, DriftError, SourcePreprocessor, SyncState, diff_header};
use crate::config::{ApplicationRef, PipedRepository, load_application_config};
use crate::diff::{DiffResult, Renderer};
use crate::git::{Checkout, GitClient};
use crate::lambda::{self, FunctionManifest, load_function_manifest};
use crate::livestate::lambda::Getter;

const CACHE_CAPACITY: u64 = 500;

pub struct LambdaChecker {
  getter: Arc<dyn Getter>,
  git: Arc<dyn GitClient>,
  preprocessor: Option<Arc<dyn SourcePreprocessor>>,
  cache: Cache<(String, String), Arc<FunctionManifest>>,
}

impl LambdaChecker {
  pub fn new(getter: Arc<dyn Getter>, git: Arc<dyn GitClient>) -> Self {
    Self {
      getter,
      git,
      preprocessor: None,
      cache: Cache::new(CACHE_CAPACITY),
    }
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
  ) -> Result<Arc<FunctionManifest>, DriftError> {
    let key = (app.id.clone(), checkout.commit.clone());
    if let Some(head) = self.cache.get(&key).await {
      return Ok(head);
    }

    let mut app_dir: PathBuf = checkout.dir.join(&app.path);
    let spec = load_application_config(&app_dir, app.config_filename())?.lambda_spec()?;

    let mut _workspace = None;
    if let Some(preprocessor) = self.preprocessor.as_ref().filter(|_| spec.generic.mutates_sources()) {
      let dir = tempfile::Builder::new()
        .prefix("detector-git-processing")
        .tempdir()
        .map_err(DriftError::TempDir)?;
      let dest = dir.path().join("repo");
      GitClient::clone_into(&*self.git, &repo.remote, &checkout.commit, &dest).await?;
      app_dir = dest.join(&app.path);
      preprocessor.process(&app_dir, &spec.generic).await?;
      _workspace = Some(dir);
    }

    let manifest = Arc::new(load_function_manifest(&app_dir, &spec.input.function_manifest_file)?);
    self.cache.insert(key, manifest.clone()).await;
    Ok(manifest)
  }
}

/// Copy the fields AWS does not report back into the live manifest.
fn fill_unreported_fields(live: &mut FunctionManifest, head: &FunctionManifest) {
  live.spec.s3_bucket = head.spec.s3_bucket.clone();
  live.spec.s3_key = head.spec.s3_key.clone();
  live.spec.s3_object_version = head.spec.s3_object_version.clone();
  live.spec.source = head.spec.source.clone();
}

pub fn make_sync_state(result: &DiffResult, commit: &str) -> SyncState {
  if !result.has_diff() {
    return SyncState::synced();
  }
  let mut long_reason = diff_header(commit);
  long_reason.push_str(&Renderer::new().with_left_padding(1).render(result.nodes()));
  SyncState::out_of_sync("The function manifest doesn't be synced", long_reason)
}

#[async_trait]
impl AppChecker for LambdaChecker {
  async fn check_application(
    &self,
    app: &ApplicationRef,
    repo: &PipedRepository,
    checkout: &Checkout,
  ) -> Result<SyncState, DriftError> {
    let head = self.load_head(app, repo, checkout).await?;
    info!(commit = %checkout.commit, "loaded head function manifest");

    let mut live = self
      .getter
      .get_function_manifest(&app.id)
      .ok_or_else(|| DriftError::NoLiveState(app.id.clone()))?;
    fill_unreported_fields(&mut live, &head);

    let result = lambda::diff(&live, &head, &drift_diff_options());
    Ok(make_sync_state(&result, &checkout.commit))
  }
}
