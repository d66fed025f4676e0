//! `K8sSync`: apply everything in Git as the primary variant.

use super::variant::{duplicate_manifests, ensure_variant_selector_in_workload, find_workload_manifests};
use super::{K8sStageError, KubernetesExecutor};
use crate::config::K8sSyncStageOptions;

pub(super) async fn run(exec: &KubernetesExecutor<'_>) -> Result<(), K8sStageError> {
  let options: K8sSyncStageOptions = if exec.input.stage.config.with.is_null() {
    exec.spec.quick_sync.clone()
  } else {
    exec.input.stage.config.options()?
  };

  exec.log_info("Loading manifests at commit for applying");
  let mut manifests = duplicate_manifests(&exec.load_manifests().await?, "");
  exec.log_success(&format!("Successfully loaded {} manifests", manifests.len()));

  let primary = exec.spec.variant_label.primary_value.clone();
  if options.add_variant_label_to_selector {
    let workloads: Vec<_> = find_workload_manifests(&manifests, &exec.spec.workloads)
      .into_iter()
      .map(|w| w.key)
      .collect();
    for m in manifests.iter_mut().filter(|m| workloads.contains(&m.key)) {
      ensure_variant_selector_in_workload(m, exec.variant_label(), &primary)?;
    }
  }

  exec
    .annotate_and_apply(&mut manifests, &primary, &exec.input.deployment.commit)
    .await?;

  if !options.prune {
    exec.log_info("Resource GC was skipped because sync.prune was not configured");
    return Ok(());
  }
  exec.prune(&manifests).await
}
