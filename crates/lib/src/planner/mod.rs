//! Deployment planning.
//!
//! The planner runs once per deployment and decides between a quick sync
//! and the configured pipeline, producing the ordered stages the executor
//! will run.

pub mod lambda;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{ApplicationKind, ApplicationRef, ConfigError, PipelineStage, ScriptRunStageOptions, StageName};
use crate::consts::{ON_ROLLBACK_KEY, SCRIPT_ENV_KEY};
use crate::executor::Stage;
use crate::lambda::{ArtifactVersion, FunctionManifestError};

#[derive(Debug, Error)]
pub enum PlannerError {
  #[error("Unable to force sync with pipeline because no pipeline was specified")]
  NoPipeline,

  #[error("planning {0:?} applications is not supported")]
  UnsupportedKind(ApplicationKind),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Manifest(#[from] FunctionManifestError),
}

/// How a deployment moves to the new version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
  /// Let the planner decide.
  #[default]
  Auto,
  QuickSync,
  Pipeline,
}

/// What started the deployment.
#[derive(Debug, Clone, Default)]
pub struct Trigger {
  /// Anything other than [`SyncStrategy::Auto`] is forced by the user.
  pub sync_strategy: SyncStrategy,
  pub strategy_summary: String,
}

#[derive(Debug, Clone)]
pub struct PlannerInput {
  pub app: ApplicationRef,
  /// Application directory at the target commit.
  pub app_dir: PathBuf,
  /// Application directory at the last successful commit.
  pub running_app_dir: Option<PathBuf>,
  pub commit: String,
  /// Empty on the first deployment.
  pub running_commit: String,
  pub trigger: Trigger,
}

#[derive(Debug, Clone)]
pub struct Plan {
  pub sync_strategy: SyncStrategy,
  pub summary: String,
  pub stages: Vec<Stage>,
  pub versions: Vec<ArtifactVersion>,
}

/// Plan the deployment of `input.app`.
pub fn plan(input: &PlannerInput) -> Result<Plan, PlannerError> {
  let plan = match input.app.kind {
    ApplicationKind::Lambda => lambda::plan(input)?,
    kind => return Err(PlannerError::UnsupportedKind(kind)),
  };
  info!(
    app_id = %input.app.id,
    strategy = ?plan.sync_strategy,
    stages = plan.stages.len(),
    "planned deployment: {}",
    plan.summary
  );
  Ok(plan)
}

/// Stages of the configured pipeline, each requiring the one before it.
///
/// With `auto_rollback` a `Rollback` stage follows, plus one
/// `ScriptRunRollback` for every `ScriptRun` that has an `onRollback`
/// command.
pub(crate) fn build_progressive_pipeline(
  configured: &[PipelineStage],
  auto_rollback: bool,
) -> Result<Vec<Stage>, PlannerError> {
  let mut stages: Vec<Stage> = Vec::with_capacity(configured.len() + 1);
  for (index, config) in configured.iter().enumerate() {
    let mut stage = Stage::new(index, config.clone());
    if let Some(prev) = stages.last() {
      stage.requires = vec![prev.id.clone()];
    }
    stages.push(stage);
  }

  if auto_rollback {
    let forward_ids: Vec<String> = stages.iter().map(|s| s.id.clone()).collect();
    let mut rollbacks = Vec::new();
    let mut rollback = Stage::rollback(stages.len(), StageName::Rollback);
    rollback.requires = forward_ids;
    rollbacks.push(rollback);

    for stage in stages.iter().filter(|s| s.name() == StageName::ScriptRun) {
      let options: ScriptRunStageOptions = stage.config.options()?;
      if options.on_rollback.is_empty() {
        continue;
      }
      let mut script = Stage::rollback(stages.len() + rollbacks.len(), StageName::ScriptRunRollback);
      script.requires = vec![stage.id.clone()];
      script.metadata = script_metadata(&options);
      rollbacks.push(script);
    }
    stages.extend(rollbacks);
  }
  Ok(stages)
}

/// A single forward stage plus `Rollback` when `auto_rollback` is set.
pub(crate) fn build_quick_sync_pipeline(name: StageName, desc: &str, auto_rollback: bool) -> Vec<Stage> {
  let mut config = PipelineStage::new(name);
  config.desc = desc.to_string();
  let sync = Stage::new(0, config);
  let mut stages = vec![sync];
  if auto_rollback {
    let mut rollback = Stage::rollback(1, StageName::Rollback);
    rollback.requires = vec![stages[0].id.clone()];
    stages.push(rollback);
  }
  stages
}

fn script_metadata(options: &ScriptRunStageOptions) -> BTreeMap<String, String> {
  let mut metadata = BTreeMap::new();
  metadata.insert(ON_ROLLBACK_KEY.to_string(), options.on_rollback.clone());
  if let Ok(env) = serde_json::to_string(&options.env) {
    metadata.insert(SCRIPT_ENV_KEY.to_string(), env);
  }
  metadata
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::LambdaPromoteStageOptions;

  fn script(on_rollback: &str) -> PipelineStage {
    PipelineStage::new(StageName::ScriptRun).with_options(&ScriptRunStageOptions {
      run: "echo run".to_string(),
      on_rollback: on_rollback.to_string(),
      ..Default::default()
    })
  }

  #[test]
  fn progressive_stages_chain_and_roll_back() {
    let configured = vec![
      PipelineStage::new(StageName::LambdaCanaryRollout),
      script("echo undo"),
      PipelineStage::new(StageName::LambdaPromote).with_options(&LambdaPromoteStageOptions::default()),
      script(""),
    ];
    let stages = build_progressive_pipeline(&configured, true).unwrap();

    let names: Vec<StageName> = stages.iter().map(Stage::name).collect();
    assert_eq!(
      names,
      vec![
        StageName::LambdaCanaryRollout,
        StageName::ScriptRun,
        StageName::LambdaPromote,
        StageName::ScriptRun,
        StageName::Rollback,
        StageName::ScriptRunRollback,
      ]
    );
    assert!(stages[0].requires.is_empty());
    assert_eq!(stages[2].requires, vec!["stage-1"]);
    assert_eq!(stages[4].requires, vec!["stage-0", "stage-1", "stage-2", "stage-3"]);
    assert!(stages[4].rollback && stages[5].rollback);
    assert_eq!(stages[5].requires, vec!["stage-1"]);
    assert_eq!(
      stages[5].metadata.get(ON_ROLLBACK_KEY).map(String::as_str),
      Some("echo undo")
    );
  }

  #[test]
  fn progressive_without_auto_rollback() {
    let stages = build_progressive_pipeline(&[script("echo undo")], false).unwrap();
    assert_eq!(stages.len(), 1);
  }

  #[test]
  fn quick_sync_stages() {
    let stages = build_quick_sync_pipeline(StageName::LambdaSync, "sync", true);
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0].config.desc, "sync");
    assert_eq!(stages[1].name(), StageName::Rollback);
    assert_eq!(stages[1].requires, vec![stages[0].id.clone()]);

    assert_eq!(build_quick_sync_pipeline(StageName::LambdaSync, "", false).len(), 1);
  }
}
