//! Sync strategy for Lambda applications.

use tracing::warn;

use super::{Plan, PlannerError, PlannerInput, SyncStrategy, build_progressive_pipeline, build_quick_sync_pipeline};
use crate::config::{LambdaApplicationSpec, StageName, load_application_config};
use crate::consts::UNKNOWN_VERSION;
use crate::lambda::{FunctionManifest, find_artifact_versions, load_function_manifest};
use crate::lambda::function::parse_container_image;

const QUICK_SYNC_DESC: &str = "Deploy the new version and configure all traffic to it";

pub fn plan(input: &PlannerInput) -> Result<Plan, PlannerError> {
  let spec = load_application_config(&input.app_dir, input.app.config_filename())?.lambda_spec()?;
  let head = load_function_manifest(&input.app_dir, &spec.input.function_manifest_file)?;
  let head_version = determine_version(&head);
  let versions = find_artifact_versions(&head).unwrap_or_else(|err| {
    warn!(app_id = %input.app.id, "unable to determine artifact versions: {}", err);
    Vec::new()
  });

  let (sync_strategy, summary) = decide(input, &spec, &head_version)?;
  let auto_rollback = spec.input.auto_rollback;
  let stages = match sync_strategy {
    SyncStrategy::Pipeline => {
      let configured = spec.generic.pipeline.as_ref().map(|p| p.stages.as_slice()).unwrap_or_default();
      build_progressive_pipeline(configured, auto_rollback)?
    }
    _ => build_quick_sync_pipeline(StageName::LambdaSync, QUICK_SYNC_DESC, auto_rollback),
  };

  Ok(Plan {
    sync_strategy,
    summary,
    stages,
    versions,
  })
}

fn decide(
  input: &PlannerInput,
  spec: &LambdaApplicationSpec,
  head_version: &str,
) -> Result<(SyncStrategy, String), PlannerError> {
  let has_pipeline = spec.generic.pipeline.as_ref().is_some_and(|p| !p.stages.is_empty());
  let trigger = &input.trigger;

  match trigger.sync_strategy {
    SyncStrategy::QuickSync => return Ok((SyncStrategy::QuickSync, trigger.strategy_summary.clone())),
    SyncStrategy::Pipeline if !has_pipeline => return Err(PlannerError::NoPipeline),
    SyncStrategy::Pipeline => return Ok((SyncStrategy::Pipeline, trigger.strategy_summary.clone())),
    SyncStrategy::Auto => {}
  }

  if !has_pipeline {
    return Ok((
      SyncStrategy::QuickSync,
      format!(
        "Quick sync to deploy version {} and configure all traffic to it (pipeline was not configured)",
        head_version
      ),
    ));
  }

  if spec.generic.planner.always_use_pipeline {
    return Ok((
      SyncStrategy::Pipeline,
      "Sync with the specified pipeline (alwaysUsePipeline was set)".to_string(),
    ));
  }

  let running_dir = input.running_app_dir.as_ref().filter(|_| !input.running_commit.is_empty());
  let Some(running_dir) = running_dir else {
    return Ok((
      SyncStrategy::QuickSync,
      format!(
        "Quick sync to deploy version {} and configure all traffic to it (it seems this is the first deployment)",
        head_version
      ),
    ));
  };

  let running = load_application_config(running_dir, input.app.config_filename())
    .and_then(|cfg| cfg.lambda_spec())
    .map_err(PlannerError::from)
    .and_then(|running| {
      load_function_manifest(running_dir, &running.input.function_manifest_file).map_err(PlannerError::from)
    });
  match running {
    Ok(running) => Ok((
      SyncStrategy::Pipeline,
      format!(
        "Sync with pipeline to update version from {} to {}",
        determine_version(&running),
        head_version
      ),
    )),
    Err(err) => {
      warn!(app_id = %input.app.id, "unable to load the running function manifest: {}", err);
      Ok((SyncStrategy::Pipeline, "Sync with the specified pipeline".to_string()))
    }
  }
}

/// Image tag, S3 object version or source ref, whichever is set first.
pub fn determine_version(manifest: &FunctionManifest) -> String {
  let spec = &manifest.spec;
  if !spec.image.is_empty() {
    let (_, tag) = parse_container_image(&spec.image);
    if !tag.is_empty() {
      return tag;
    }
  }
  if !spec.s3_object_version.is_empty() {
    return spec.s3_object_version.clone();
  }
  if !spec.source.git_ref.is_empty() {
    return spec.source.git_ref.clone();
  }
  UNKNOWN_VERSION.to_string()
}

#[cfg(test)]
mod tests {
  use std::path::Path;

  use super::*;
  use crate::config::{ApplicationKind, ApplicationRef};
  use crate::lambda::parse_function_manifest;
  use crate::planner::Trigger;

  const PIPELINE_CONFIG: &str = r#"apiVersion: pipecd.dev/v1beta1
kind: LambdaApp
spec:
  pipeline:
    stages:
      - name: LambdaCanaryRollout
      - name: LambdaPromote
        with:
          percent: 10
      - name: LambdaPromote
        with:
          percent: 100
"#;

  const QUICK_CONFIG: &str = "apiVersion: pipecd.dev/v1beta1\nkind: LambdaApp\nspec: {}\n";

  fn function(image: &str) -> String {
    format!(
      "apiVersion: pipecd.dev/v1beta1\nkind: LambdaFunction\nspec:\n  name: hello\n  role: arn:aws:iam::123:role/lambda\n  image: {}\n  memory: 128\n  timeout: 5\n",
      image
    )
  }

  fn write(dir: &Path, config: &str, image: &str) {
    std::fs::write(dir.join("app.pipecd.yaml"), config).unwrap();
    std::fs::write(dir.join("function.yaml"), function(image)).unwrap();
  }

  fn input(app_dir: &Path, running: Option<&Path>) -> PlannerInput {
    PlannerInput {
      app: ApplicationRef {
        id: "app-1".to_string(),
        name: "hello".to_string(),
        kind: ApplicationKind::Lambda,
        platform_provider: "lambda".to_string(),
        repo_id: "repo".to_string(),
        path: String::new(),
        config_filename: String::new(),
      },
      app_dir: app_dir.to_path_buf(),
      running_app_dir: running.map(Path::to_path_buf),
      commit: "bbbb".to_string(),
      running_commit: if running.is_some() { "aaaa".to_string() } else { String::new() },
      trigger: Trigger::default(),
    }
  }

  #[test]
  fn no_pipeline_means_quick_sync() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), QUICK_CONFIG, "ecr.aws/acme/hello:v2");

    let plan = plan(&input(dir.path(), None)).unwrap();
    assert_eq!(plan.sync_strategy, SyncStrategy::QuickSync);
    assert_eq!(
      plan.summary,
      "Quick sync to deploy version v2 and configure all traffic to it (pipeline was not configured)"
    );
    let names: Vec<StageName> = plan.stages.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec![StageName::LambdaSync, StageName::Rollback]);
    assert_eq!(plan.versions[0].version, "v2");
  }

  #[test]
  fn first_deployment_is_quick_synced() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), PIPELINE_CONFIG, "ecr.aws/acme/hello:v2");

    let plan = plan(&input(dir.path(), None)).unwrap();
    assert_eq!(plan.sync_strategy, SyncStrategy::QuickSync);
    assert!(plan.summary.ends_with("(it seems this is the first deployment)"));
  }

  #[test]
  fn version_change_uses_pipeline() {
    let head = tempfile::tempdir().unwrap();
    let running = tempfile::tempdir().unwrap();
    write(head.path(), PIPELINE_CONFIG, "ecr.aws/acme/hello:v2");
    write(running.path(), PIPELINE_CONFIG, "ecr.aws/acme/hello:v1");

    let plan = plan(&input(head.path(), Some(running.path()))).unwrap();
    assert_eq!(plan.sync_strategy, SyncStrategy::Pipeline);
    assert_eq!(plan.summary, "Sync with pipeline to update version from v1 to v2");
    let names: Vec<StageName> = plan.stages.iter().map(|s| s.name()).collect();
    assert_eq!(
      names,
      vec![
        StageName::LambdaCanaryRollout,
        StageName::LambdaPromote,
        StageName::LambdaPromote,
        StageName::Rollback,
      ]
    );
  }

  #[test]
  fn unreadable_running_manifest_still_uses_pipeline() {
    let head = tempfile::tempdir().unwrap();
    let running = tempfile::tempdir().unwrap();
    write(head.path(), PIPELINE_CONFIG, "ecr.aws/acme/hello:v2");

    let plan = plan(&input(head.path(), Some(running.path()))).unwrap();
    assert_eq!(plan.sync_strategy, SyncStrategy::Pipeline);
    assert_eq!(plan.summary, "Sync with the specified pipeline");
  }

  #[test]
  fn always_use_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let config = PIPELINE_CONFIG.replace("spec:\n", "spec:\n  planner:\n    alwaysUsePipeline: true\n");
    write(dir.path(), &config, "ecr.aws/acme/hello:v2");

    let plan = plan(&input(dir.path(), None)).unwrap();
    assert_eq!(plan.sync_strategy, SyncStrategy::Pipeline);
    assert_eq!(plan.summary, "Sync with the specified pipeline (alwaysUsePipeline was set)");
  }

  #[test]
  fn forced_strategies() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), QUICK_CONFIG, "ecr.aws/acme/hello:v2");
    let mut forced = input(dir.path(), None);

    forced.trigger = Trigger {
      sync_strategy: SyncStrategy::Pipeline,
      strategy_summary: "Forced by user".to_string(),
    };
    assert!(matches!(plan(&forced), Err(PlannerError::NoPipeline)));

    forced.trigger.sync_strategy = SyncStrategy::QuickSync;
    let plan = plan(&forced).unwrap();
    assert_eq!(plan.sync_strategy, SyncStrategy::QuickSync);
    assert_eq!(plan.summary, "Forced by user");
  }

  #[test]
  fn version_sources() {
    let image = parse_function_manifest(&function("ecr.aws/acme/hello:v1.2.0")).unwrap();
    assert_eq!(determine_version(&image), "v1.2.0");

    let mut s3 = image.clone();
    s3.spec.image = String::new();
    s3.spec.s3_object_version = "3Bd0x".to_string();
    assert_eq!(determine_version(&s3), "3Bd0x");

    let mut source = s3.clone();
    source.spec.s3_object_version = String::new();
    source.spec.source.git_ref = "release-1".to_string();
    assert_eq!(determine_version(&source), "release-1");

    source.spec.source.git_ref = String::new();
    assert_eq!(determine_version(&source), UNKNOWN_VERSION);
  }
}
