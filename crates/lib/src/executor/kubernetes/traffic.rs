//! `K8sTrafficRouting`: split traffic between the variants.
//!
//! Pod-selector routing can only send everything to one variant by pointing
//! the Service selector at it. Istio routing rewrites the weights of the
//! VirtualService routes for the application host.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::variant::{check_variant_selector_in_service, find_service_manifests};
use super::{K8sStageError, KubernetesExecutor, failed};
use crate::config::{IstioTrafficRouting, K8sTrafficRoutingStageOptions, TrafficRoutingMethod};
use crate::consts::{BASELINE_PERCENTAGE_KEY, CANARY_PERCENTAGE_KEY, PRIMARY_PERCENTAGE_KEY};
use crate::executor::MetadataStore;
use crate::kubernetes::Manifest;

/// Traffic shares in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Split {
  primary: i32,
  canary: i32,
  baseline: i32,
}

pub(super) async fn run(exec: &KubernetesExecutor<'_>) -> Result<(), K8sStageError> {
  let options: K8sTrafficRoutingStageOptions = exec.input.stage.config.options()?;
  let (primary, canary, baseline) = options.percentages();
  let split = Split {
    primary,
    canary,
    baseline,
  };

  let values: BTreeMap<String, String> = [
    (PRIMARY_PERCENTAGE_KEY, split.primary),
    (CANARY_PERCENTAGE_KEY, split.canary),
    (BASELINE_PERCENTAGE_KEY, split.baseline),
  ]
  .into_iter()
  .map(|(k, v)| (k.to_string(), v.to_string()))
  .collect();
  if let Err(err) = exec.input.metadata.put_stage(&exec.input.stage.id, values).await {
    exec.log_error(&format!("Unable to save the traffic percentages: {}", err));
  }

  let manifests = exec.load_manifests().await?;
  let method = exec.spec.traffic_routing_method();
  let candidates = match method {
    TrafficRoutingMethod::PodSelector => find_service_manifests(&exec.spec.service.name, &manifests),
    TrafficRoutingMethod::Istio => {
      let name = istio_config(exec).virtual_service.name;
      manifests
        .into_iter()
        .filter(|m| m.key.is_virtual_service() && (name.is_empty() || m.key.name == name))
        .collect()
    }
  };
  let Some(target) = candidates.first() else {
    return Err(failed("Unable to find any traffic routing manifests"));
  };
  if candidates.len() > 1 {
    exec.log_info(&format!(
      "Detected {} traffic routing manifests but only the first one ({}) will be used",
      candidates.len(),
      target.key.readable_string()
    ));
  }

  let mut routed = match method {
    TrafficRoutingMethod::PodSelector => route_by_pod(exec, target, split)?,
    TrafficRoutingMethod::Istio => route_by_istio(exec, target, split)?,
  };

  exec.log_info(&format!(
    "Routing traffic: primary={}%, canary={}%, baseline={}%",
    split.primary, split.canary, split.baseline
  ));
  let primary_value = exec.spec.variant_label.primary_value.clone();
  exec.add_builtin_annotations(
    std::slice::from_mut(&mut routed),
    &primary_value,
    &exec.input.deployment.commit,
  );
  exec.apply_manifests(std::slice::from_ref(&routed)).await
}

fn istio_config(exec: &KubernetesExecutor<'_>) -> IstioTrafficRouting {
  exec
    .spec
    .traffic_routing
    .as_ref()
    .and_then(|t| t.istio.clone())
    .unwrap_or_default()
}

fn route_by_pod(exec: &KubernetesExecutor<'_>, service: &Manifest, split: Split) -> Result<Manifest, K8sStageError> {
  let labels = &exec.spec.variant_label;
  check_variant_selector_in_service(service, &labels.key, &labels.primary_value)
    .map_err(|e| failed(format!("Traffic routing by Pod requires a variant label in the Service selector ({})", e)))?;

  let variant = if split.primary == 100 {
    &labels.primary_value
  } else if split.canary == 100 {
    &labels.canary_value
  } else {
    return Err(failed(format!(
      "Traffic routing by Pod requires either PRIMARY or CANARY must be 100 (primary={}, canary={})",
      split.primary, split.canary
    )));
  };

  let mut routed = service.clone();
  let selector = [(labels.key.clone(), variant.clone())].into_iter().collect();
  routed.add_string_map_values(&selector, &["spec", "selector"])?;
  Ok(routed)
}

fn route_by_istio(exec: &KubernetesExecutor<'_>, vs: &Manifest, split: Split) -> Result<Manifest, K8sStageError> {
  if split.primary + split.canary + split.baseline > 100 {
    return Err(failed(format!(
      "Traffic percentages must not exceed 100 in total (primary={}, canary={}, baseline={})",
      split.primary, split.canary, split.baseline
    )));
  }
  let istio = istio_config(exec);
  if istio.host.is_empty() {
    return Err(failed("trafficRouting.istio.host must be configured"));
  }
  let labels = &exec.spec.variant_label;
  let variants = [
    labels.primary_value.as_str(),
    labels.canary_value.as_str(),
    labels.baseline_value.as_str(),
  ];

  let mut routed = vs.clone();
  let Some(http) = routed
    .nested_field_mut(&["spec", "http"])
    .and_then(Value::as_array_mut)
  else {
    return Err(failed(format!("VirtualService {} has no http routes", vs.key.name)));
  };

  for route in http.iter_mut() {
    let name = route.get("name").and_then(Value::as_str).unwrap_or_default();
    if !istio.editable_routes.is_empty() && !istio.editable_routes.iter().any(|r| r == name) {
      continue;
    }
    let destinations = route.get("route").and_then(Value::as_array).cloned().unwrap_or_default();
    let others: Vec<Value> = destinations
      .into_iter()
      .filter(|d| d.pointer("/destination/host").and_then(Value::as_str) != Some(istio.host.as_str()))
      .collect();
    let weights = split_weights(split, &others);

    let mut rewritten: Vec<Value> = variants
      .iter()
      .zip(weights)
      .map(|(subset, weight)| {
        json!({
          "destination": { "host": istio.host, "subset": subset },
          "weight": weight,
        })
      })
      .collect();
    rewritten.extend(others);
    if let Some(obj) = route.as_object_mut() {
      obj.insert("route".to_string(), Value::Array(rewritten));
    }
  }
  Ok(routed)
}

/// Weights of (primary, canary, baseline) once `others` keep theirs.
fn split_weights(split: Split, others: &[Value]) -> [i32; 3] {
  let other: i64 = others
    .iter()
    .filter_map(|d| d.get("weight").and_then(Value::as_i64))
    .sum();
  let available = (100 - other).max(0) as i32;
  let canary = split.canary * available / 100;
  let baseline = split.baseline * available / 100;
  [available - canary - baseline, canary, baseline]
}
