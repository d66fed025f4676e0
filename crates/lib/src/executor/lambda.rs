//! Stages of Lambda deployments.
//!
//! Every deploy publishes an immutable function version; traffic moves
//! between versions by editing the weights of the `Service` alias.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::{ExecutorError, Input, MetadataStore, StageStatus};
use crate::config::{ConfigError, LambdaPromoteStageOptions, StageName, load_application_config};
use crate::consts::{
  LAMBDA_TAG_APPLICATION, LAMBDA_TAG_COMMIT_HASH, LAMBDA_TAG_MANAGED_BY, LAMBDA_TAG_PIPED, MANAGED_BY_PIPED,
  PROMOTE_PERCENTAGE_KEY, PROMOTE_VERSION_KEY,
};
use crate::git::{GitClient, GitError};
use crate::lambda::{
  FunctionManifest, FunctionManifestError, LambdaClient, LambdaError, RoutingTrafficConfig, VersionTraffic,
  load_function_manifest,
};

#[derive(Debug, Error)]
pub enum LambdaStageError {
  #[error(transparent)]
  Executor(#[from] ExecutorError),

  #[error("Failed while loading application config ({0})")]
  Config(#[from] ConfigError),

  #[error("Failed while loading function manifest ({0})")]
  Manifest(#[from] FunctionManifestError),

  #[error(transparent)]
  Client(#[from] LambdaError),

  #[error("Failed while fetching the function source ({0})")]
  Git(#[from] GitError),

  #[error("Failed while archiving the function source ({0})")]
  Archive(String),

  #[error("{0}")]
  Failed(String),
}

fn failed(message: impl Into<String>) -> LambdaStageError {
  LambdaStageError::Failed(message.into())
}

/// Run a Lambda stage. Failures are written to the stage log.
pub async fn execute(input: &Input) -> StageStatus {
  match run(input).await {
    Ok(()) => StageStatus::Success,
    Err(err) => {
      input.log.error(&err.to_string());
      StageStatus::Failure
    }
  }
}

async fn run(input: &Input) -> Result<(), LambdaStageError> {
  let deployment = &input.deployment;
  let name = input.stage.name();
  let (app_dir, commit) = match name {
    StageName::Rollback => {
      let dir = deployment
        .running_app_dir()
        .filter(|_| !deployment.running_commit.is_empty())
        .ok_or_else(|| {
          failed("Unable to determine the last deployed commit to rollback. It seems this is the first deployment.")
        })?;
      (dir, deployment.running_commit.clone())
    }
    _ => (deployment.app_dir(), deployment.commit.clone()),
  };

  let spec = load_application_config(&app_dir, deployment.app.config_filename())?.lambda_spec()?;
  let mut manifest = load_function_manifest(&app_dir, &spec.input.function_manifest_file)?;
  let client = input.clients.lambda_client(&deployment.app.platform_provider).await?;
  add_builtin_tags(&mut manifest, input, &commit);

  let exec = LambdaExecutor { input, client, manifest };
  match name {
    StageName::LambdaSync => exec.sync().await,
    StageName::LambdaCanaryRollout => exec.canary_rollout().await,
    StageName::LambdaPromote => exec.promote().await,
    StageName::Rollback => {
      input.log.info(&format!("Rolling back to the running commit {}", commit));
      exec.sync().await
    }
    other => Err(failed(format!("Unsupported stage {} for Lambda application", other))),
  }
}

fn add_builtin_tags(manifest: &mut FunctionManifest, input: &Input, commit: &str) {
  let tags: BTreeMap<String, String> = [
    (LAMBDA_TAG_MANAGED_BY, MANAGED_BY_PIPED),
    (LAMBDA_TAG_PIPED, input.piped_id.as_str()),
    (LAMBDA_TAG_APPLICATION, input.deployment.app.id.as_str()),
    (LAMBDA_TAG_COMMIT_HASH, commit),
  ]
  .into_iter()
  .map(|(k, v)| (k.to_string(), v.to_string()))
  .collect();
  manifest.spec.tags.extend(tags);
}

struct LambdaExecutor<'a> {
  input: &'a Input,
  client: Arc<dyn LambdaClient>,
  manifest: FunctionManifest,
}

impl LambdaExecutor<'_> {
  fn function_name(&self) -> &str {
    &self.manifest.spec.name
  }

  /// Deploy, publish and send all traffic to the new version.
  async fn sync(&self) -> Result<(), LambdaStageError> {
    let version = self.deploy_and_publish().await?;
    let fm = &self.manifest;
    match self.client.get_traffic_config(fm).await {
      Err(err) if err.is_not_found() => self.client.create_traffic_config(fm, &version).await?,
      Err(err) => return Err(err.into()),
      Ok(_) => {
        self
          .client
          .update_traffic_config(fm, &RoutingTrafficConfig::all_to(version.as_str()))
          .await?
      }
    }
    self.input.log.success(&format!(
      "Successfully routed all traffic of {} to version {}",
      self.function_name(),
      version
    ));
    Ok(())
  }

  /// Deploy and publish without moving traffic; the version is left for
  /// `LambdaPromote`.
  async fn canary_rollout(&self) -> Result<(), LambdaStageError> {
    let version = self.deploy_and_publish().await?;
    self.input.metadata.put_shared(PROMOTE_VERSION_KEY, &version).await?;
    self.input.log.success(&format!(
      "Successfully rolled out version {} of {} without routing traffic to it",
      version,
      self.function_name()
    ));
    Ok(())
  }

  async fn promote(&self) -> Result<(), LambdaStageError> {
    let options: LambdaPromoteStageOptions = self.input.stage.config.options()?;
    let percent = options.percent.int();
    let Some(version) = self.input.metadata.shared(PROMOTE_VERSION_KEY).await else {
      return Err(failed("Unable to determine the version to promote, was LambdaCanaryRollout run?"));
    };

    let fm = &self.manifest;
    let current = match self.client.get_traffic_config(fm).await {
      Err(err) if err.is_not_found() => {
        return Err(failed(format!(
          "Traffic routing of {} was not configured, sync the function first",
          self.function_name()
        )));
      }
      other => other?,
    };

    let routing = promoted_routing(&current, &version, percent);
    self.client.update_traffic_config(fm, &routing).await?;

    let values = [(PROMOTE_PERCENTAGE_KEY.to_string(), percent.to_string())].into_iter().collect();
    if let Err(err) = self.input.metadata.put_stage(&self.input.stage.id, values).await {
      self.input.log.error(&format!("Unable to save the promote percentage: {}", err));
    }
    let mut message = format!(
      "Successfully promoted {} to version {} (primary {}%",
      self.function_name(),
      version,
      routing.primary.percent
    );
    if let Some(secondary) = &routing.secondary {
      message.push_str(&format!(", version {} at {}%", secondary.version, secondary.percent));
    }
    message.push(')');
    self.input.log.success(&message);
    Ok(())
  }

  async fn deploy_and_publish(&self) -> Result<String, LambdaStageError> {
    let fm = &self.manifest;
    let name = self.function_name();
    let exists = self.client.is_function_exist(name).await?;
    let source = if fm.spec.source.git.is_empty() {
      None
    } else {
      Some(self.source_archive().await?)
    };

    match (exists, source) {
      (true, Some(zip)) => self.client.update_function_from_source(fm, zip).await?,
      (true, None) => self.client.update_function(fm).await?,
      (false, Some(zip)) => self.client.create_function_from_source(fm, zip).await?,
      (false, None) => self.client.create_function(fm).await?,
    }
    self.input.log.info(&format!(
      "Successfully {} Lambda function {}",
      if exists { "updated" } else { "created" },
      name
    ));

    let version = self.client.publish_function(fm).await?;
    self
      .input
      .log
      .info(&format!("Successfully committed new version {} for Lambda function {}", version, name));
    Ok(version)
  }

  /// Zip of the function source checked out from its git repository.
  async fn source_archive(&self) -> Result<Vec<u8>, LambdaStageError> {
    let source = &self.manifest.spec.source;
    let Some(git) = &self.input.git else {
      return Err(failed("Function source is stored in git but no git client is configured"));
    };
    let workspace = tempfile::Builder::new()
      .prefix("lambda-source")
      .tempdir()
      .map_err(|e| LambdaStageError::Archive(e.to_string()))?;
    let dest = workspace.path().join("repo");
    GitClient::clone_into(&**git, &source.git, &source.git_ref, &dest).await?;

    let root = dest.join(&source.path);
    let archive = tokio::task::spawn_blocking(move || zip_dir(&root))
      .await
      .map_err(|e| LambdaStageError::Archive(e.to_string()))?
      .map_err(|e| LambdaStageError::Archive(e.to_string()))?;
    debug!(bytes = archive.len(), "archived function source");
    Ok(archive)
  }
}

/// Routing with `version` as the alias primary at `100 - percent` and the
/// previously serving version as secondary at `percent`.
///
/// Promoting the version that is already primary keeps the version behind
/// it as the secondary.
fn promoted_routing(current: &RoutingTrafficConfig, version: &str, percent: i32) -> RoutingTrafficConfig {
  let previous = if current.primary.version == version {
    current.secondary.as_ref().map(|s| s.version.clone())
  } else {
    Some(current.primary.version.clone())
  };
  let Some(previous) = previous.filter(|v| v != version) else {
    return RoutingTrafficConfig::all_to(version);
  };
  if percent >= 100 {
    return RoutingTrafficConfig::all_to(version);
  }
  let percent = f64::from(percent.max(0));
  RoutingTrafficConfig {
    primary: VersionTraffic::new(version, 100.0 - percent),
    secondary: Some(VersionTraffic::new(previous, percent)),
  }
}

/// Zip every file under `root`, skipping `.git`.
pub fn zip_dir(root: &Path) -> Result<Vec<u8>, zip::result::ZipError> {
  let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
  let walker = WalkDir::new(root)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.file_name() != ".git");

  for entry in walker {
    let entry = entry.map_err(std::io::Error::from)?;
    if !entry.file_type().is_file() {
      continue;
    }
    let Ok(relative) = entry.path().strip_prefix(root) else {
      continue;
    };
    let name = relative
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/");

    #[allow(unused_mut)]
    let mut options = SimpleFileOptions::default();
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      options = options.unix_permissions(entry.metadata().map_err(std::io::Error::from)?.permissions().mode());
    }

    writer.start_file(name, options)?;
    writer.write_all(&std::fs::read(entry.path())?)?;
  }
  Ok(writer.finish()?.into_inner())
}
