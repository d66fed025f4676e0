//! `K8sCanaryRollout` and `K8sCanaryClean`.

use super::patch::apply_patch;
use super::variant::{
  find_config_maps, find_secrets, find_service_manifests, find_workload_manifests,
  generate_variant_service_manifests, generate_variant_workload_manifests, make_suffixed_name,
};
use super::{K8sStageError, KubernetesExecutor, failed};
use crate::config::K8sCanaryRolloutStageOptions;
use crate::consts::CANARY_RESOURCES_KEY;
use crate::kubernetes::Manifest;

pub(super) async fn rollout(exec: &KubernetesExecutor<'_>) -> Result<(), K8sStageError> {
  let options: K8sCanaryRolloutStageOptions = exec.input.stage.config.options()?;
  let commit = &exec.input.deployment.commit;

  let manifests = exec.load_manifests().await?;
  if manifests.is_empty() {
    return Err(failed("This application has no Kubernetes manifests to handle"));
  }

  let mut generated = generate(exec, &options, &manifests)?;
  for patch in &options.patches {
    apply_patch(&mut generated, patch)?;
  }

  let canary = exec.spec.variant_label.canary_value.as_str();
  exec.add_builtin_annotations(&mut generated, canary, commit);
  exec.record_resources(CANARY_RESOURCES_KEY, &generated).await?;

  exec.log_info("Start rolling out CANARY variant...");
  exec.apply_manifests(&generated).await?;
  exec.log_success("Successfully rolled out CANARY variant");
  Ok(())
}

fn generate(
  exec: &KubernetesExecutor<'_>,
  options: &K8sCanaryRolloutStageOptions,
  manifests: &[Manifest],
) -> Result<Vec<Manifest>, K8sStageError> {
  let spec = &exec.spec;
  let label = exec.variant_label();
  let canary = spec.variant_label.canary_value.as_str();
  let suffix = if options.suffix.is_empty() { canary } else { options.suffix.as_str() };
  let mut generated = Vec::new();

  let workloads = find_workload_manifests(manifests, &spec.workloads);
  if workloads.is_empty() {
    return Err(failed("Unable to find any workload manifests for CANARY variant"));
  }

  if options.create_service {
    let services = find_service_manifests(&spec.service.name, manifests);
    let Some(service) = services.into_iter().next() else {
      return Err(failed(format!(
        "Unable to find any service for name={:?}",
        spec.service.name
      )));
    };
    generated.extend(generate_variant_service_manifests(&[service], label, canary, suffix)?);
  }

  // The canary mounts its own copies of the configs so patches to them do
  // not leak into the primary.
  let config_maps = find_config_maps(manifests);
  let secrets = find_secrets(manifests);
  generated.extend(generate_variant_workload_manifests(
    &workloads,
    &config_maps,
    &secrets,
    label,
    canary,
    suffix,
    |current| options.replicas.calculate(current.unwrap_or(1), 1),
  )?);
  generated.extend(
    config_maps
      .iter()
      .chain(&secrets)
      .map(|m| m.duplicate(&make_suffixed_name(&m.key.name, suffix))),
  );
  Ok(generated)
}

pub(super) async fn clean(exec: &KubernetesExecutor<'_>) -> Result<(), K8sStageError> {
  exec.log_info("Start cleaning CANARY variant");
  exec
    .remove_recorded_resources(CANARY_RESOURCES_KEY, &exec.spec.variant_label.canary_value)
    .await?;
  exec.log_success("Successfully cleaned CANARY variant");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::super::execute;
  use super::super::tests::{APP_CONFIG, DEPLOYMENT, SERVICE, k8s_fixture};
  use super::*;
  use crate::config::{Replicas, StageName};
  use crate::executor::testing::stage_with;
  use crate::executor::{MetadataStore, StageStatus};

  const CONFIG: &str = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec:\n  service:\n    name: web\n";

  const CONFIG_MAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web-config\ndata:\n  LEVEL: debug\n";

  fn deployment_with_config() -> String {
    DEPLOYMENT.replace(
      "          image: ghcr.io/acme/web:v2\n",
      "          image: ghcr.io/acme/web:v2\n          envFrom:\n            - configMapRef:\n                name: web-config\n",
    )
  }

  #[tokio::test]
  async fn rolls_out_canary_and_records_resources() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = deployment_with_config();
    let fx = k8s_fixture(
      dir.path(),
      CONFIG,
      &[
        ("deployment.yaml", deployment.as_str()),
        ("service.yaml", SERVICE),
        ("config.yaml", CONFIG_MAP),
      ],
      stage_with(
        StageName::K8sCanaryRollout,
        &K8sCanaryRolloutStageOptions {
          replicas: Replicas::Percentage(50),
          create_service: true,
          ..Default::default()
        },
      ),
    );

    assert_eq!(execute(&fx.input).await, StageStatus::Success);

    let applier = fx.clients.applier("default");
    let d = applier.applied("apps/v1:Deployment:default:web-canary").unwrap();
    assert_eq!(d.replicas(), Some(2));
    assert_eq!(d.annotation("pipecd.dev/variant"), Some("canary"));
    assert_eq!(
      d.nested_field(&["spec", "selector", "matchLabels", "pipecd.dev/variant"]),
      Some(&serde_json::Value::from("canary"))
    );
    assert!(applier.applied("v1:Service:default:web-canary").is_some());
    assert!(applier.applied("v1:ConfigMap:default:web-config-canary").is_some());
    // The primary is left alone.
    assert!(applier.applied("apps/v1:Deployment:default:web").is_none());

    let recorded = fx.metadata.shared(CANARY_RESOURCES_KEY).await.unwrap();
    let mut keys: Vec<&str> = recorded.split(',').collect();
    keys.sort();
    assert_eq!(
      keys,
      vec![
        "apps/v1:Deployment:default:web-canary",
        "v1:ConfigMap:default:web-config-canary",
        "v1:Service:default:web-canary",
      ]
    );
    assert!(fx.log.text().contains("Successfully rolled out CANARY variant"));
  }

  #[tokio::test]
  async fn missing_workloads_fail() {
    let dir = tempfile::tempdir().unwrap();
    let fx = k8s_fixture(
      dir.path(),
      APP_CONFIG,
      &[("service.yaml", SERVICE)],
      stage_with(StageName::K8sCanaryRollout, &K8sCanaryRolloutStageOptions::default()),
    );

    assert_eq!(execute(&fx.input).await, StageStatus::Failure);
    assert!(
      fx.log
        .text()
        .contains("Unable to find any workload manifests for CANARY variant")
    );
  }

  #[tokio::test]
  async fn clean_without_recorded_resources_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fx = k8s_fixture(
      dir.path(),
      APP_CONFIG,
      &[],
      stage_with(StageName::K8sCanaryClean, &serde_json::json!({})),
    );

    assert_eq!(execute(&fx.input).await, StageStatus::Failure);
    assert!(fx.log.text().contains("Unable to determine the applied CANARY resources"));
  }

  #[tokio::test]
  async fn clean_twice_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let fx = k8s_fixture(
      dir.path(),
      APP_CONFIG,
      &[],
      stage_with(StageName::K8sCanaryClean, &serde_json::json!({})),
    );
    fx.metadata
      .put_shared(CANARY_RESOURCES_KEY, "apps/v1:Deployment:default:web-canary")
      .await
      .unwrap();

    assert_eq!(execute(&fx.input).await, StageStatus::Success);
    fx.clients
      .applier("default")
      .missing
      .lock()
      .push("apps/v1:Deployment:default:web-canary".parse().unwrap());
    assert_eq!(execute(&fx.input).await, StageStatus::Success);
    assert_eq!(fx.clients.applier("default").calls().len(), 2);
  }
}
