//! Feeds the store from cluster watches.
//!
//! API discovery picks the watched resource types: a built-in whitelist of
//! groups, versions and kinds, adjusted by the provider's include and
//! exclude matchers. One watcher runs per type; the store is initialized
//! once every watcher finished its initial listing.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::TypeMeta;
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope, verbs};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::Store;
use crate::config::{KubernetesProviderConfig, ResourceMatcher};
use crate::consts::ANNOTATION_PIPED;
use crate::kubernetes::{ApiVersionKind, Manifest};
use crate::livestate::LiveStateError;

const GROUP_WHITELIST: &[&str] = &[
  "",
  "apps",
  "extensions",
  "storage.k8s.io",
  "autoscaling",
  "networking.k8s.io",
  "apiextensions.k8s.io",
  "rbac.authorization.k8s.io",
];

const VERSION_WHITELIST: &[&str] = &["v1", "v1beta1", "v1beta2"];

const KIND_WHITELIST: &[&str] = &[
  "Service",
  "Endpoints",
  "Deployment",
  "DaemonSet",
  "StatefulSet",
  "ReplicationController",
  "ReplicaSet",
  "Pod",
  "ConfigMap",
  "Secret",
  "Ingress",
  "NetworkPolicy",
  "StorageClass",
  "PersistentVolume",
  "PersistentVolumeClaim",
  "HorizontalPodAutoscaler",
  "Role",
  "RoleBinding",
  "ClusterRole",
  "ClusterRoleBinding",
  "CustomResourceDefinition",
];

/// System objects every managed cluster carries, as
/// `apiVersion:kind:namespace:name`.
const IGNORED_RESOURCE_KEYS: &[&str] = &[
  "v1:Service:default:kubernetes",
  "v1:Service:kube-system:heapster",
  "v1:Service:kube-system:metrics-server",
  "v1:Service:kube-system:kube-dns",
  "v1:Service:kube-system:kubernetes-dashboard",
  "v1:Service:kube-system:default-http-backend",
  "apps/v1:Deployment:kube-system:kube-dns",
  "apps/v1:Deployment:kube-system:kube-dns-autoscaler",
  "apps/v1:Deployment:kube-system:fluentd-gcp-scaler",
  "apps/v1:Deployment:kube-system:kubernetes-dashboard",
  "apps/v1:Deployment:kube-system:l7-default-backend",
  "apps/v1:Deployment:kube-system:heapster-gke",
  "apps/v1:Deployment:kube-system:stackdriver-metadata-agent-cluster-level",
  "extensions/v1beta1:Deployment:kube-system:kube-dns",
  "extensions/v1beta1:Deployment:kube-system:kube-dns-autoscaler",
  "extensions/v1beta1:Deployment:kube-system:fluentd-gcp-scaler",
  "extensions/v1beta1:Deployment:kube-system:kubernetes-dashboard",
  "extensions/v1beta1:Deployment:kube-system:l7-default-backend",
  "extensions/v1beta1:Deployment:kube-system:heapster-gke",
  "extensions/v1beta1:Deployment:kube-system:stackdriver-metadata-agent-cluster-level",
  "v1:Endpoints:kube-system:kube-controller-manager",
  "v1:Endpoints:kube-system:kube-scheduler",
  "v1:Endpoints:kube-system:vpa-recommender",
  "v1:Endpoints:kube-system:gcp-controller-manager",
  "v1:Endpoints:kube-system:managed-certificate-controller",
  "v1:ConfigMap:kube-system:cluster-kubestore",
  "v1:ConfigMap:kube-system:ingress-gce-lock",
  "v1:ConfigMap:kube-system:gke-common-webhook-lock",
  "v1:ConfigMap:kube-system:cluster-autoscaler-status",
  "rbac.authorization.k8s.io/v1:ClusterRole::system:managed-certificate-controller",
  "rbac.authorization.k8s.io/v1:ClusterRoleBinding::system:managed-certificate-controller",
];

/// Build a client from the provider's kubeconfig and master URL, falling
/// back to in-cluster or default kubeconfig discovery.
pub async fn kube_client(provider: &KubernetesProviderConfig) -> Result<Client, LiveStateError> {
  let mut config = if provider.kubeconfig_path.is_empty() {
    Config::infer().await.map_err(|e| LiveStateError::Client(e.to_string()))?
  } else {
    let kubeconfig =
      Kubeconfig::read_from(&provider.kubeconfig_path).map_err(|e| LiveStateError::Client(e.to_string()))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
      .await
      .map_err(|e| LiveStateError::Client(e.to_string()))?
  };
  if !provider.master_url.is_empty() {
    config.cluster_url = provider
      .master_url
      .parse()
      .map_err(|e| LiveStateError::Client(format!("invalid master url {}: {}", provider.master_url, e)))?;
  }
  Client::try_from(config).map_err(|e| LiveStateError::Client(e.to_string()))
}

fn matches(matcher: &ResourceMatcher, api_version: &str, kind: &str) -> bool {
  matcher.api_version == api_version && (matcher.kind.is_empty() || matcher.kind == kind)
}

/// Whether a discovered resource type should be watched.
pub fn is_watched_type(provider: &KubernetesProviderConfig, resource: &ApiResource, caps: &ApiCapabilities) -> bool {
  if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::WATCH) {
    return false;
  }
  let informer = &provider.app_state_informer;
  let api_version = resource.api_version.as_str();
  let kind = resource.kind.as_str();
  if informer.exclude_resources.iter().any(|m| matches(m, api_version, kind)) {
    return false;
  }
  if informer.include_resources.iter().any(|m| matches(m, api_version, kind)) {
    return true;
  }
  KIND_WHITELIST.contains(&kind)
    && GROUP_WHITELIST.contains(&resource.group.as_str())
    && VERSION_WHITELIST.contains(&resource.version.as_str())
}

/// Drop well-known system objects and objects another piped manages.
pub fn is_ignored(manifest: &Manifest, piped_id: &str) -> bool {
  let key = format!(
    "{}:{}:{}:{}",
    manifest.api_version(),
    manifest.kind(),
    manifest.namespace(),
    manifest.name()
  );
  if IGNORED_RESOURCE_KEYS.contains(&key.as_str()) {
    return true;
  }
  match manifest.annotation(ANNOTATION_PIPED) {
    Some(owner) => !owner.is_empty() && !piped_id.is_empty() && owner != piped_id,
    None => false,
  }
}

pub struct Reflector {
  client: Client,
  provider: KubernetesProviderConfig,
  piped_id: String,
}

impl Reflector {
  pub fn new(client: Client, provider: KubernetesProviderConfig, piped_id: impl Into<String>) -> Self {
    Self {
      client,
      provider,
      piped_id: piped_id.into(),
    }
  }

  async fn discover(&self) -> Result<Vec<(ApiResource, ApiCapabilities)>, LiveStateError> {
    let discovery = Discovery::new(self.client.clone())
      .run()
      .await
      .map_err(|e| LiveStateError::Client(format!("failed to discover api resources: {}", e)))?;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for group in discovery.groups() {
      for (resource, caps) in group.recommended_resources() {
        if !is_watched_type(&self.provider, &resource, &caps) {
          continue;
        }
        if seen.insert((resource.api_version.clone(), resource.plural.clone())) {
          targets.push((resource, caps));
        }
      }
    }
    Ok(targets)
  }

  fn api_for(&self, resource: &ApiResource, caps: &ApiCapabilities) -> Option<Api<DynamicObject>> {
    let namespace = &self.provider.app_state_informer.namespace;
    if namespace.is_empty() {
      return Some(Api::all_with(self.client.clone(), resource));
    }
    match caps.scope {
      Scope::Namespaced => Some(Api::namespaced_with(self.client.clone(), namespace, resource)),
      // Cluster-wide objects are outside a single-namespace scope.
      Scope::Cluster => None,
    }
  }

  /// Watch until cancelled. The store is marked failed if discovery fails.
  pub async fn run(self, store: Arc<Store>, cancel: CancellationToken) -> Result<(), LiveStateError> {
    let targets = match self.discover().await {
      Ok(targets) => targets,
      Err(e) => {
        store.fail(e.to_string());
        return Err(e);
      }
    };

    store.set_watching_kinds(
      targets
        .iter()
        .map(|(resource, _)| ApiVersionKind::new(&resource.api_version, &resource.kind))
        .collect(),
    );

    let apis: Vec<(ApiResource, Api<DynamicObject>)> = targets
      .iter()
      .filter_map(|(resource, caps)| self.api_for(resource, caps).map(|api| (resource.clone(), api)))
      .collect();
    info!(count = apis.len(), "start watching resources");
    if apis.is_empty() {
      store.initialize();
    }

    let pending = Arc::new(AtomicUsize::new(apis.len()));
    let mut watchers = JoinSet::new();
    for (resource, api) in apis {
      let store = store.clone();
      let pending = pending.clone();
      let cancel = cancel.clone();
      let piped_id = self.piped_id.clone();
      watchers.spawn(async move {
        watch_resource(api, resource, store, pending, piped_id, cancel).await;
      });
    }

    cancel.cancelled().await;
    watchers.shutdown().await;
    Ok(())
  }
}

fn into_manifest(mut object: DynamicObject, resource: &ApiResource) -> Option<Manifest> {
  object.types = Some(TypeMeta {
    api_version: resource.api_version.clone(),
    kind: resource.kind.clone(),
  });
  serde_json::to_value(&object)
    .ok()
    .and_then(|value| Manifest::from_value(value).ok())
}

async fn watch_resource(
  api: Api<DynamicObject>,
  resource: ApiResource,
  store: Arc<Store>,
  pending: Arc<AtomicUsize>,
  piped_id: String,
  cancel: CancellationToken,
) {
  let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();
  let mut synced = false;
  loop {
    let event = tokio::select! {
      _ = cancel.cancelled() => return,
      event = stream.next() => event,
    };
    let event = match event {
      Some(Ok(event)) => event,
      Some(Err(e)) => {
        warn!(kind = %resource.kind, error = %e, "watch failed, retrying");
        continue;
      }
      None => return,
    };

    let (object, op) = match event {
      watcher::Event::Init => continue,
      watcher::Event::InitDone => {
        if !synced {
          synced = true;
          info!(api_version = %resource.api_version, kind = %resource.kind, "initial listing has been synced");
          if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            store.initialize();
          }
        }
        continue;
      }
      watcher::Event::InitApply(object) => (object, "add"),
      watcher::Event::Apply(object) => (object, "update"),
      watcher::Event::Delete(object) => (object, "delete"),
    };
    let Some(manifest) = into_manifest(object, &resource) else {
      continue;
    };
    if is_ignored(&manifest, &piped_id) {
      continue;
    }
    debug!(key = %manifest.key, op, "received watch event");
    match op {
      "add" => store.on_add(manifest),
      "update" => store.on_update(manifest),
      _ => store.on_delete(&manifest),
    }
  }
}
