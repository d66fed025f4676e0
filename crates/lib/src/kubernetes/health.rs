//! Health of live resources.
//!
//! Workload rules follow what `kubectl rollout status` waits for.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use super::manifest::Manifest;
use super::resource_key::{
  KIND_DAEMON_SET, KIND_DEPLOYMENT, KIND_POD, KIND_REPLICA_SET, KIND_STATEFUL_SET, is_builtin_api_version,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
  Healthy,
  Other,
  Unknown,
}

impl std::fmt::Display for HealthStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      HealthStatus::Healthy => "HEALTHY",
      HealthStatus::Other => "OTHER",
      HealthStatus::Unknown => "UNKNOWN",
    })
  }
}

const APPLIED: &str = "Successfully applied to the cluster";

/// Classify a live object.
pub fn determine_health(manifest: &Manifest) -> (HealthStatus, String) {
  if !is_builtin_api_version(&manifest.key.api_version) {
    return (HealthStatus::Unknown, format!("Unimplemented or unknown resource: {}", manifest.key.api_version_kind()));
  }
  let result = match manifest.key.kind.as_str() {
    KIND_DEPLOYMENT => manifest.to_structured().map(|d: Deployment| deployment_health(&d)),
    KIND_STATEFUL_SET => manifest.to_structured().map(|s: StatefulSet| stateful_set_health(&s)),
    KIND_DAEMON_SET => manifest.to_structured().map(|d: DaemonSet| daemon_set_health(&d)),
    KIND_REPLICA_SET => manifest.to_structured().map(|r: ReplicaSet| replica_set_health(&r)),
    KIND_POD => manifest.to_structured().map(|p: Pod| pod_health(&p)),
    _ => return (HealthStatus::Healthy, APPLIED.to_string()),
  };
  result.unwrap_or_else(|e| (HealthStatus::Unknown, format!("Unexpected error while calculating: {}", e)))
}

fn healthy() -> (HealthStatus, String) {
  (HealthStatus::Healthy, APPLIED.to_string())
}

fn other(description: impl Into<String>) -> (HealthStatus, String) {
  (HealthStatus::Other, description.into())
}

fn deployment_health(obj: &Deployment) -> (HealthStatus, String) {
  let spec = obj.spec.clone().unwrap_or_default();
  let status = obj.status.clone().unwrap_or_default();

  if spec.paused.unwrap_or(false) {
    return (HealthStatus::Unknown, "Deployment is paused".to_string());
  }
  if obj.metadata.generation.unwrap_or(0) > status.observed_generation.unwrap_or(0) {
    return other("Waiting for rollout to finish because observed deployment generation less than desired generation");
  }
  for cond in status.conditions.iter().flatten() {
    if cond.type_ == "Progressing" && cond.reason.as_deref() == Some("ProgressDeadlineExceeded") {
      return other(format!(
        "Deployment {:?} exceeded its progress deadline",
        obj.metadata.name.clone().unwrap_or_default()
      ));
    }
  }

  let Some(desired) = spec.replicas else {
    return (HealthStatus::Unknown, "The number of desired replicas is unspecified".to_string());
  };
  let replicas = status.replicas.unwrap_or(0);
  let updated = status.updated_replicas.unwrap_or(0);
  let available = status.available_replicas.unwrap_or(0);
  if updated < desired {
    return other(format!("Waiting for remaining {}/{} replicas to be updated", updated, desired));
  }
  if updated < replicas {
    return other(format!("{} old replicas are pending termination", replicas - updated));
  }
  if available < replicas {
    return other(format!(
      "Waiting for remaining {}/{} replicas to be available",
      replicas - available,
      replicas
    ));
  }
  healthy()
}

fn stateful_set_health(obj: &StatefulSet) -> (HealthStatus, String) {
  let spec = obj.spec.clone().unwrap_or_default();
  let status = obj.status.clone().unwrap_or_default();

  let observed = status.observed_generation.unwrap_or(0);
  if observed == 0 || obj.metadata.generation.unwrap_or(0) > observed {
    return other("Waiting for statefulset spec update to be observed");
  }
  let Some(desired) = spec.replicas else {
    return other("The number of desired replicas is unspecified");
  };
  let ready = status.ready_replicas.unwrap_or(0);
  if desired != ready {
    return other(format!(
      "The number of ready replicas ({}) is different from the desired number ({})",
      ready, desired
    ));
  }

  let strategy = spec.update_strategy.unwrap_or_default();
  if strategy.type_.as_deref() == Some("RollingUpdate") {
    if let Some(rolling) = strategy.rolling_update {
      if let Some(partition) = rolling.partition {
        let updated = status.updated_replicas.unwrap_or(0);
        if updated < desired - partition {
          return other(format!(
            "Waiting for partitioned roll out to finish because {} out of {} new pods have been updated",
            updated,
            desired - partition
          ));
        }
      }
      return healthy();
    }
  }

  if status.update_revision != status.current_revision {
    return other(format!(
      "Waiting for statefulset rolling update to complete {} pods at revision {}",
      status.updated_replicas.unwrap_or(0),
      status.update_revision.unwrap_or_default()
    ));
  }
  healthy()
}

fn daemon_set_health(obj: &DaemonSet) -> (HealthStatus, String) {
  let status = obj.status.clone().unwrap_or_default();
  let name = obj.metadata.name.clone().unwrap_or_default();

  let observed = status.observed_generation.unwrap_or(0);
  if observed == 0 || obj.metadata.generation.unwrap_or(0) > observed {
    return other("Waiting for rollout to finish because observed daemon set generation less than desired generation");
  }
  let desired = status.desired_number_scheduled;
  let updated = status.updated_number_scheduled.unwrap_or(0);
  let available = status.number_available.unwrap_or(0);
  if updated < desired {
    return other(format!(
      "Waiting for daemon set {:?} rollout to finish because {} out of {} new pods have been updated",
      name, updated, desired
    ));
  }
  if available < desired {
    return other(format!(
      "Waiting for daemon set {:?} rollout to finish because {} of {} updated pods are available",
      name, available, desired
    ));
  }
  if status.number_misscheduled > 0 {
    return other(format!(
      "{} nodes that are running the daemon pod, but are not supposed to run the daemon pod",
      status.number_misscheduled
    ));
  }
  let unavailable = status.number_unavailable.unwrap_or(0);
  if unavailable > 0 {
    return other(format!(
      "{} nodes that should be running the daemon pod and have none of the daemon pod running and available",
      unavailable
    ));
  }
  healthy()
}

fn replica_set_health(obj: &ReplicaSet) -> (HealthStatus, String) {
  let spec = obj.spec.clone().unwrap_or_default();
  let status = obj.status.clone().unwrap_or_default();

  let observed = status.observed_generation.unwrap_or(0);
  if observed == 0 || obj.metadata.generation.unwrap_or(0) > observed {
    return other("Waiting for rollout to finish because observed replica set generation less than desired generation");
  }
  let failure = status
    .conditions
    .iter()
    .flatten()
    .find(|c| c.type_ == "ReplicaFailure" && c.status == "True");
  if let Some(cond) = failure {
    return other(cond.message.clone().unwrap_or_default());
  }
  let Some(desired) = spec.replicas else {
    return other("The number of desired replicas is unspecified");
  };
  let available = status.available_replicas.unwrap_or(0);
  if available < desired {
    return other(format!(
      "Waiting for remaining {}/{} replicas to be available",
      status.replicas - available,
      status.replicas
    ));
  }
  let ready = status.ready_replicas.unwrap_or(0);
  if desired != ready {
    return other(format!(
      "The number of ready replicas ({}) is different from the desired number ({})",
      ready, desired
    ));
  }
  healthy()
}

fn pod_health(obj: &Pod) -> (HealthStatus, String) {
  let status = obj.status.clone().unwrap_or_default();
  let restart_policy = obj
    .spec
    .as_ref()
    .and_then(|s| s.restart_policy.clone())
    .unwrap_or_default();

  for container in status.container_statuses.iter().flatten() {
    let Some(state) = container.state.as_ref() else {
      continue;
    };
    if let Some(waiting) = state.waiting.as_ref() {
      let reason = waiting.reason.clone().unwrap_or_default();
      if reason.starts_with("Err") || reason.ends_with("Error") || reason.ends_with("BackOff") {
        return other(waiting.message.clone().unwrap_or(reason));
      }
    }
  }

  match status.phase.as_deref().unwrap_or_default() {
    "Pending" => other(status.message.unwrap_or_else(|| "Pod is pending".to_string())),
    "Failed" => other(status.message.unwrap_or_else(|| "Pod has failed".to_string())),
    "Succeeded" => healthy(),
    "Running" => {
      if restart_policy == "Always" {
        let all_ready = status.conditions.iter().flatten().any(|c| c.type_ == "Ready" && c.status == "True");
        if !all_ready {
          return other(status.message.unwrap_or_else(|| "Pod is not ready".to_string()));
        }
      }
      healthy()
    }
    _ => (
      HealthStatus::Unknown,
      status.message.unwrap_or_else(|| "Pod phase is unknown".to_string()),
    ),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kubernetes::manifest::parse_manifests;

  fn health(yaml: &str) -> (HealthStatus, String) {
    let manifests = parse_manifests(yaml).unwrap();
    determine_health(&manifests[0])
  }

  #[test]
  fn deployment_rules() {
    let base = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  generation: 2\nspec:\n  replicas: 3\n  selector: {}\n  template: {}\n";

    let (status, _) = health(&format!("{}status:\n  observedGeneration: 1\n", base));
    assert_eq!(status, HealthStatus::Other);

    let (status, desc) = health(&format!(
      "{}status:\n  observedGeneration: 2\n  replicas: 3\n  updatedReplicas: 2\n",
      base
    ));
    assert_eq!(status, HealthStatus::Other);
    assert_eq!(desc, "Waiting for remaining 2/3 replicas to be updated");

    let (status, _) = health(&format!(
      "{}status:\n  observedGeneration: 2\n  replicas: 3\n  updatedReplicas: 3\n  availableReplicas: 3\n",
      base
    ));
    assert_eq!(status, HealthStatus::Healthy);

    let (status, desc) = health(&format!(
      "{}status:\n  observedGeneration: 2\n  conditions:\n  - type: Progressing\n    status: \"False\"\n    reason: ProgressDeadlineExceeded\n",
      base
    ));
    assert_eq!(status, HealthStatus::Other);
    assert!(desc.contains("exceeded its progress deadline"));
  }

  #[test]
  fn daemon_set_misscheduled() {
    let (status, desc) = health(
      "apiVersion: apps/v1\nkind: DaemonSet\nmetadata:\n  name: agent\n  generation: 1\nstatus:\n  observedGeneration: 1\n  desiredNumberScheduled: 2\n  currentNumberScheduled: 2\n  updatedNumberScheduled: 2\n  numberAvailable: 2\n  numberReady: 2\n  numberMisscheduled: 1\n",
    );
    assert_eq!(status, HealthStatus::Other);
    assert!(desc.starts_with("1 nodes"));
  }

  #[test]
  fn pod_in_crash_loop() {
    let (status, _) = health(
      "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\nspec:\n  containers: []\nstatus:\n  phase: Running\n  containerStatuses:\n  - name: c\n    image: i\n    imageID: \"\"\n    ready: false\n    restartCount: 4\n    state:\n      waiting:\n        reason: CrashLoopBackOff\n",
    );
    assert_eq!(status, HealthStatus::Other);
  }

  #[test]
  fn other_kinds() {
    let (status, _) = health("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n");
    assert_eq!(status, HealthStatus::Healthy);

    let (status, _) = health("apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n");
    assert_eq!(status, HealthStatus::Unknown);
  }
}
