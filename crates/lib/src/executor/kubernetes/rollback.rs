//! `Rollback` of Kubernetes deployments.
//!
//! Re-applies the manifests of the last successful deployment as the primary
//! and removes whatever canary or baseline resources this deployment created.

use std::path::PathBuf;

use super::variant::{duplicate_manifests, ensure_variant_selector_in_workload, find_workload_manifests};
use super::{K8sStageError, KubernetesExecutor, failed};
use crate::consts::{BASELINE_RESOURCES_KEY, CANARY_RESOURCES_KEY};
use crate::executor::{Input, MetadataStore};

const NO_RUNNING_COMMIT: &str =
  "Unable to determine the last deployed commit to rollback. It seems this is the first deployment.";

/// Application directory at the running commit.
pub(super) fn running_app_dir(input: &Input) -> Result<PathBuf, K8sStageError> {
  if input.deployment.running_commit.is_empty() {
    return Err(failed(NO_RUNNING_COMMIT));
  }
  input.deployment.running_app_dir().ok_or_else(|| failed(NO_RUNNING_COMMIT))
}

pub(super) async fn run(exec: &KubernetesExecutor<'_>) -> Result<(), K8sStageError> {
  let running_commit = &exec.input.deployment.running_commit;
  exec.log_info(&format!("Rolling back to the running commit {}", running_commit));

  let mut ok = true;
  if let Err(err) = rollback_primary(exec, running_commit).await {
    exec.log_error(&format!("Failed to roll back the primary variant ({})", err));
    ok = false;
  }

  for (key, variant) in [
    (CANARY_RESOURCES_KEY, exec.spec.variant_label.canary_value.as_str()),
    (BASELINE_RESOURCES_KEY, exec.spec.variant_label.baseline_value.as_str()),
  ] {
    if exec.input.metadata.shared(key).await.is_none() {
      continue;
    }
    exec.log_info(&format!("Removing resources of {} variant", variant.to_uppercase()));
    if let Err(err) = exec.remove_recorded_resources(key, variant).await {
      exec.log_error(&format!("Failed to remove {} resources ({})", variant.to_uppercase(), err));
      ok = false;
    }
  }

  if !ok {
    return Err(failed("Rollback finished with errors"));
  }
  exec.log_success("Successfully rolled back the deployment");
  Ok(())
}

async fn rollback_primary(exec: &KubernetesExecutor<'_>, running_commit: &str) -> Result<(), K8sStageError> {
  let mut manifests = duplicate_manifests(&exec.load_running_manifests().await?, "");
  let primary = exec.spec.variant_label.primary_value.clone();

  if exec.spec.quick_sync.add_variant_label_to_selector {
    let workloads: Vec<_> = find_workload_manifests(&manifests, &exec.spec.workloads)
      .into_iter()
      .map(|w| w.key)
      .collect();
    for m in manifests.iter_mut().filter(|m| workloads.contains(&m.key)) {
      ensure_variant_selector_in_workload(m, exec.variant_label(), &primary)?;
    }
  }

  exec.annotate_and_apply(&mut manifests, &primary, running_commit).await
}
