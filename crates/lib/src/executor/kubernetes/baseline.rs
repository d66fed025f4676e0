//! `K8sBaselineRollout` and `K8sBaselineClean`.
//!
//! The baseline runs the currently deployed version next to the canary so
//! both can be compared under the same load.

use super::variant::{
  find_service_manifests, find_workload_manifests, generate_variant_service_manifests,
  generate_variant_workload_manifests,
};
use super::{K8sStageError, KubernetesExecutor, failed};
use crate::config::K8sBaselineRolloutStageOptions;
use crate::consts::BASELINE_RESOURCES_KEY;
use crate::kubernetes::Manifest;

pub(super) async fn rollout(exec: &KubernetesExecutor<'_>) -> Result<(), K8sStageError> {
  let options: K8sBaselineRolloutStageOptions = exec.input.stage.config.options()?;
  let running_commit = &exec.input.deployment.running_commit;
  if running_commit.is_empty() {
    return Err(failed(
      "Unable to determine the last deployed commit to create BASELINE variant",
    ));
  }

  exec.log_info(&format!("Loading manifests at the running commit {}", running_commit));
  let manifests = exec.load_running_manifests().await?;
  let mut generated = generate(exec, &options, &manifests)?;

  let baseline = exec.spec.variant_label.baseline_value.as_str();
  exec.add_builtin_annotations(&mut generated, baseline, running_commit);
  exec.record_resources(BASELINE_RESOURCES_KEY, &generated).await?;

  exec.log_info("Start rolling out BASELINE variant...");
  exec.apply_manifests(&generated).await?;
  exec.log_success("Successfully rolled out BASELINE variant");
  Ok(())
}

fn generate(
  exec: &KubernetesExecutor<'_>,
  options: &K8sBaselineRolloutStageOptions,
  manifests: &[Manifest],
) -> Result<Vec<Manifest>, K8sStageError> {
  let spec = &exec.spec;
  let label = exec.variant_label();
  let baseline = spec.variant_label.baseline_value.as_str();
  let suffix = if options.suffix.is_empty() { baseline } else { options.suffix.as_str() };
  let mut generated = Vec::new();

  let workloads = find_workload_manifests(manifests, &spec.workloads);
  if workloads.is_empty() {
    return Err(failed("Unable to find any workload manifests for BASELINE variant"));
  }

  if options.create_service {
    let services = find_service_manifests(&spec.service.name, manifests);
    let Some(service) = services.into_iter().next() else {
      return Err(failed(format!(
        "Unable to find any service for name={:?}",
        spec.service.name
      )));
    };
    generated.extend(generate_variant_service_manifests(&[service], label, baseline, suffix)?);
  }

  // Baseline pods share the primary's configs.
  generated.extend(generate_variant_workload_manifests(
    &workloads,
    &[],
    &[],
    label,
    baseline,
    suffix,
    |current| options.replicas.calculate(current.unwrap_or(1), 1),
  )?);
  Ok(generated)
}

pub(super) async fn clean(exec: &KubernetesExecutor<'_>) -> Result<(), K8sStageError> {
  exec.log_info("Start cleaning BASELINE variant");
  exec
    .remove_recorded_resources(BASELINE_RESOURCES_KEY, &exec.spec.variant_label.baseline_value)
    .await?;
  exec.log_success("Successfully cleaned BASELINE variant");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::super::execute;
  use super::super::tests::{APP_CONFIG, DEPLOYMENT, k8s_fixture};
  use super::*;
  use crate::config::{Replicas, StageName};
  use crate::executor::testing::{stage_with, write_app};
  use crate::executor::{MetadataStore, StageStatus};

  fn options() -> K8sBaselineRolloutStageOptions {
    K8sBaselineRolloutStageOptions {
      replicas: Replicas::Number(1),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn first_deployment_has_no_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let fx = k8s_fixture(
      dir.path(),
      APP_CONFIG,
      &[("deployment.yaml", DEPLOYMENT)],
      stage_with(StageName::K8sBaselineRollout, &options()),
    );

    assert_eq!(execute(&fx.input).await, StageStatus::Failure);
    assert!(fx.log.text().contains("Unable to determine the last deployed commit"));
  }

  #[tokio::test]
  async fn baseline_runs_the_running_version() {
    let head = tempfile::tempdir().unwrap();
    let running = tempfile::tempdir().unwrap();
    let running_deployment = DEPLOYMENT.replace("web:v2", "web:v1");
    write_app(
      running.path(),
      &[
        ("app.pipecd.yaml", APP_CONFIG),
        ("deployment.yaml", running_deployment.as_str()),
      ],
    );
    let mut fx = k8s_fixture(
      head.path(),
      APP_CONFIG,
      &[("deployment.yaml", DEPLOYMENT)],
      stage_with(StageName::K8sBaselineRollout, &options()),
    );
    fx.input.deployment.running_commit = "fedcba9876543210".to_string();
    fx.input.deployment.running_repo_dir = Some(running.path().to_path_buf());

    assert_eq!(execute(&fx.input).await, StageStatus::Success);

    let d = fx
      .clients
      .applier("default")
      .applied("apps/v1:Deployment:default:web-baseline")
      .unwrap();
    assert_eq!(d.replicas(), Some(1));
    assert_eq!(d.annotation("pipecd.dev/commit-hash"), Some("fedcba9876543210"));
    assert_eq!(
      d.to_value().pointer("/spec/template/spec/containers/0/image"),
      Some(&serde_json::Value::from("ghcr.io/acme/web:v1"))
    );
    assert_eq!(
      fx.metadata.shared(BASELINE_RESOURCES_KEY).await.as_deref(),
      Some("apps/v1:Deployment:default:web-baseline")
    );
  }
}
