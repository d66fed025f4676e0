//! `ScriptRun` and `ScriptRunRollback`.
//!
//! Runs a user command in the application directory with `SR_*` variables
//! describing the deployment. The rollback half runs the `onRollback`
//! command saved by the `ScriptRun` stage it belongs to.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Input, LogPersister, LogSeverity, MetadataStore, StageStatus};
use crate::config::{GenericApplicationSpec, ScriptRunStageOptions, load_application_config};
use crate::consts::{ON_ROLLBACK_KEY, SCRIPT_ENV_KEY, SCRIPT_ENV_PREFIX};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Execute the `ScriptRun` stage.
pub async fn run(input: &Input, cancel: &CancellationToken) -> StageStatus {
  let options: ScriptRunStageOptions = match input.stage.config.options() {
    Ok(options) => options,
    Err(err) => {
      input.log.error(&format!("Failed to decode ScriptRun options ({})", err));
      return StageStatus::Failure;
    }
  };

  // Saved for the rollback stage, which may run in another process.
  let env = serde_json::to_string(&options.env).unwrap_or_default();
  let values = [
    (ON_ROLLBACK_KEY.to_string(), options.on_rollback.clone()),
    (SCRIPT_ENV_KEY.to_string(), env),
  ]
  .into_iter()
  .collect();
  if let Err(err) = input.metadata.put_stage(&input.stage.id, values).await {
    input.log.error(&format!("Unable to save the rollback command: {}", err));
  }

  if options.run.is_empty() {
    return StageStatus::Success;
  }
  let script = Script {
    command: &options.run,
    env: &options.env,
    timeout: options.timeout,
    rollback: false,
  };
  script.execute(input, &input.deployment.app_dir(), cancel).await
}

/// Execute the `onRollback` command of the `ScriptRun` stage this one requires.
pub async fn rollback(input: &Input, cancel: &CancellationToken) -> StageStatus {
  let command = saved_value(input, ON_ROLLBACK_KEY).await.unwrap_or_default();
  if command.is_empty() {
    input.log.info("No onRollback command was configured, nothing to do");
    return StageStatus::Success;
  }
  let env: BTreeMap<String, String> = match saved_value(input, SCRIPT_ENV_KEY).await {
    Some(raw) if !raw.is_empty() => match serde_json::from_str(&raw) {
      Ok(env) => env,
      Err(err) => {
        input.log.error(&format!("Unable to decode the saved script environment ({})", err));
        return StageStatus::Failure;
      }
    },
    _ => BTreeMap::new(),
  };

  let dir = input
    .deployment
    .running_app_dir()
    .filter(|d| d.is_dir())
    .unwrap_or_else(|| input.deployment.app_dir());
  let script = Script {
    command: &command,
    env: &env,
    timeout: Duration::ZERO,
    rollback: true,
  };
  script.execute(input, &dir, cancel).await
}

/// Value planned into the stage, or saved by one of the stages it requires.
async fn saved_value(input: &Input, key: &str) -> Option<String> {
  if let Some(value) = input.stage.metadata.get(key) {
    return Some(value.clone());
  }
  for id in &input.stage.requires {
    if let Some(value) = input.metadata.stage(id, key).await {
      return Some(value);
    }
  }
  None
}

struct Script<'a> {
  command: &'a str,
  env: &'a BTreeMap<String, String>,
  timeout: Duration,
  rollback: bool,
}

enum Outcome {
  Exited(std::io::Result<ExitStatus>),
  TimedOut,
  Cancelled,
}

impl Script<'_> {
  async fn execute(&self, input: &Input, dir: &Path, cancel: &CancellationToken) -> StageStatus {
    let timeout = if self.timeout.is_zero() { DEFAULT_TIMEOUT } else { self.timeout };
    input.log.info(&format!("Running commands: {}", self.command));

    let mut command = Command::new("/bin/sh");
    command
      .args(["-l", "-c", self.command])
      .current_dir(dir)
      .envs(script_env(input, dir, self.rollback))
      .envs(self.env)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    debug!(dir = %dir.display(), rollback = self.rollback, "spawning script");

    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(err) => {
        input.log.error(&format!("Failed to start the script ({})", err));
        return StageStatus::Failure;
      }
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let log = input.log.as_ref();

    let outcome = {
      let finished = async {
        let (_, _, status) = tokio::join!(
          forward(stdout, log, LogSeverity::Info),
          forward(stderr, log, LogSeverity::Error),
          child.wait(),
        );
        status
      };
      tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        status = finished => Outcome::Exited(status),
      }
    };

    match outcome {
      Outcome::Exited(Ok(status)) if status.success() => {
        input.log.success("Successfully executed the script");
        StageStatus::Success
      }
      Outcome::Exited(Ok(status)) => {
        let code = status.code().map_or_else(|| "signal".to_string(), |c| c.to_string());
        input.log.error(&format!("Script exited with status {}", code));
        StageStatus::Failure
      }
      Outcome::Exited(Err(err)) => {
        input.log.error(&format!("Failed while waiting for the script ({})", err));
        StageStatus::Failure
      }
      Outcome::TimedOut => {
        let _ = child.kill().await;
        input.log.error("Canceled because of timeout");
        StageStatus::Failure
      }
      Outcome::Cancelled => {
        let _ = child.kill().await;
        input.log.info("Script was cancelled");
        StageStatus::Cancelled
      }
    }
  }
}

async fn forward<R: AsyncRead + Unpin>(reader: Option<R>, log: &dyn LogPersister, severity: LogSeverity) {
  let Some(reader) = reader else {
    return;
  };
  let mut lines = BufReader::new(reader).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    log.append(severity, &line);
  }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextInfo<'a> {
  #[serde(rename = "deploymentID")]
  deployment_id: &'a str,
  #[serde(rename = "applicationID")]
  application_id: &'a str,
  application_name: &'a str,
  triggered_at: u64,
  triggered_commit_hash: &'a str,
  #[serde(rename = "repositoryURL")]
  repository_url: &'a str,
  labels: &'a BTreeMap<String, String>,
  is_rollback: bool,
  summary: &'a str,
}

/// `SR_*` variables describing the deployment.
fn script_env(input: &Input, app_dir: &Path, rollback: bool) -> Vec<(String, String)> {
  let deployment = &input.deployment;
  let labels = app_labels(app_dir, deployment.app.config_filename());
  let context = ContextInfo {
    deployment_id: &deployment.id,
    application_id: &deployment.app.id,
    application_name: &deployment.app.name,
    triggered_at: deployment.triggered_at,
    triggered_commit_hash: &deployment.commit,
    repository_url: &deployment.repository_url,
    labels: &labels,
    is_rollback: rollback,
    summary: &deployment.summary,
  };

  let var = |name: &str, value: String| (format!("{}{}", SCRIPT_ENV_PREFIX, name), value);
  let mut env = vec![
    var("DEPLOYMENT_ID", deployment.id.clone()),
    var("APPLICATION_ID", deployment.app.id.clone()),
    var("APPLICATION_NAME", deployment.app.name.clone()),
    var("TRIGGERED_AT", deployment.triggered_at.to_string()),
    var("TRIGGERED_COMMIT_HASH", deployment.commit.clone()),
    var("REPOSITORY_URL", deployment.repository_url.clone()),
    var("SUMMARY", deployment.summary.clone()),
    var("IS_ROLLBACK", rollback.to_string()),
    var("CONTEXT_RAW", serde_json::to_string(&context).unwrap_or_default()),
  ];
  env.extend(
    labels
      .iter()
      .map(|(k, v)| var(&format!("LABELS_{}", env_name(k)), v.clone())),
  );
  env
}

fn env_name(key: &str) -> String {
  key
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
    .collect()
}

/// Labels of the application, empty when its configuration can't be read.
fn app_labels(app_dir: &Path, filename: &str) -> BTreeMap<String, String> {
  load_application_config(app_dir, filename)
    .ok()
    .and_then(|cfg| serde_yaml::from_value::<GenericApplicationSpec>(cfg.spec).ok())
    .map(|spec| spec.labels)
    .unwrap_or_default()
}
