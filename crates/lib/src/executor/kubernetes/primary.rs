//! `K8sPrimaryRollout`: roll the primary variant forward to the head commit.

use super::variant::{
  check_variant_selector_in_workload, duplicate_manifests, ensure_variant_selector_in_workload,
  find_service_manifests, find_workload_manifests, generate_variant_service_manifests,
};
use super::{K8sStageError, KubernetesExecutor, failed};
use crate::config::{K8sPrimaryRolloutStageOptions, StageName, TrafficRoutingMethod};
use crate::kubernetes::Manifest;

pub(super) async fn run(exec: &KubernetesExecutor<'_>) -> Result<(), K8sStageError> {
  let options: K8sPrimaryRolloutStageOptions = exec.input.stage.config.options()?;
  let spec = &exec.spec;
  let label = exec.variant_label();
  let primary = spec.variant_label.primary_value.as_str();

  let manifests = exec.load_manifests().await?;
  if manifests.is_empty() {
    return Err(failed("This application has no Kubernetes manifests to handle"));
  }

  let routing_by_pod = spec.traffic_routing_method() == TrafficRoutingMethod::PodSelector
    && spec.generic.has_stage(StageName::K8sTrafficRouting);
  if routing_by_pod && !options.add_variant_label_to_selector {
    for w in find_workload_manifests(&manifests, &spec.workloads) {
      check_variant_selector_in_workload(&w, label, primary).map_err(|e| {
        failed(format!(
          "Traffic routing by Pod requires the variant label in the selector of workload {} ({})",
          w.key.name, e
        ))
      })?;
    }
  }

  let mut generated = generate(exec, &options, &manifests)?;
  exec
    .annotate_and_apply(&mut generated, primary, &exec.input.deployment.commit)
    .await?;
  exec.log_success("Successfully rolled out PRIMARY variant");

  if !options.prune {
    exec.log_info("Resource GC was skipped because prune was not configured");
    return Ok(());
  }
  exec.prune(&generated).await
}

fn generate(
  exec: &KubernetesExecutor<'_>,
  options: &K8sPrimaryRolloutStageOptions,
  manifests: &[Manifest],
) -> Result<Vec<Manifest>, K8sStageError> {
  let spec = &exec.spec;
  let label = exec.variant_label();
  let primary = spec.variant_label.primary_value.as_str();
  let mut generated = duplicate_manifests(manifests, "");

  if options.add_variant_label_to_selector {
    let workloads: Vec<_> = find_workload_manifests(manifests, &spec.workloads)
      .into_iter()
      .map(|w| w.key)
      .collect();
    for m in generated.iter_mut().filter(|m| workloads.contains(&m.key)) {
      ensure_variant_selector_in_workload(m, label, primary)?;
    }
  }

  if options.create_service {
    let services = find_service_manifests(&spec.service.name, manifests);
    let Some(service) = services.into_iter().next() else {
      return Err(failed(format!(
        "Unable to find any service for name={:?}",
        spec.service.name
      )));
    };
    let suffix = if options.suffix.is_empty() { primary } else { options.suffix.as_str() };
    generated.extend(generate_variant_service_manifests(&[service], label, primary, suffix)?);
  }

  // Istio routing is owned by the traffic routing stage.
  if spec.traffic_routing_method() == TrafficRoutingMethod::Istio {
    let name = spec
      .traffic_routing
      .as_ref()
      .and_then(|t| t.istio.as_ref())
      .map(|i| i.virtual_service.name.clone())
      .unwrap_or_default();
    generated.retain(|m| !(m.key.is_virtual_service() && (name.is_empty() || m.key.name == name)));
  }
  Ok(generated)
}
