//! In-memory graph of the cluster resources each application owns.
//!
//! Resources are kept in two flat maps keyed by UID: `apps` groups them per
//! application, `resources` remembers every seen object with its owners so
//! children created by controllers can be attributed by walking owner
//! references. Every placement or removal is also appended to an event
//! buffer consumed through [`EventIterator`]s.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::consts::ANNOTATION_APPLICATION;
use crate::kubernetes::health::{HealthStatus, determine_health};
use crate::kubernetes::{ApiVersionKind, Manifest, ResourceKey};
use crate::livestate::LiveStateError;

pub const DEFAULT_EVENTS_SOFT_LIMIT: usize = 900;
pub const DEFAULT_EVENTS_HARD_LIMIT: usize = 1000;

/// One resource placed under an application.
#[derive(Debug, Clone)]
pub struct AppNode {
  pub uid: String,
  pub key: ResourceKey,
  pub manifest: Manifest,
  pub owner_uids: Vec<String>,
  pub health: HealthStatus,
  pub health_description: String,
  pub updated_at: SystemTime,
}

/// Resources of one application.
///
/// `managing_nodes` carry the application annotation themselves;
/// `depended_nodes` were created by controllers on their behalf.
#[derive(Debug, Clone)]
pub struct AppNodes {
  pub app_id: String,
  pub managing_nodes: HashMap<String, AppNode>,
  pub depended_nodes: HashMap<String, AppNode>,
  pub updated_at: SystemTime,
  pub version: AppNodesVersion,
}

/// When the node set last changed and how many changes it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppNodesVersion {
  pub timestamp: SystemTime,
  pub increment: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
  Added,
  Updated,
  Deleted,
}

#[derive(Debug, Clone)]
pub struct ResourceEvent {
  pub app_id: String,
  pub event_type: EventType,
  pub uid: String,
  pub key: ResourceKey,
  pub owner_uids: Vec<String>,
  pub health: HealthStatus,
  pub health_description: String,
  pub created_at: SystemTime,
}

impl AppNodes {
  fn new(app_id: &str, now: SystemTime) -> Self {
    Self {
      app_id: app_id.to_string(),
      managing_nodes: HashMap::new(),
      depended_nodes: HashMap::new(),
      updated_at: now,
      version: AppNodesVersion {
        timestamp: now,
        increment: 0,
      },
    }
  }

  fn touch(&mut self, now: SystemTime) {
    self.updated_at = now;
    self.version = AppNodesVersion {
      timestamp: now,
      increment: self.version.increment + 1,
    };
  }

  fn put(&mut self, managing: bool, uid: &str, manifest: &Manifest, owners: &[String], now: SystemTime) -> ResourceEvent {
    let (health, health_description) = determine_health(manifest);
    let node = AppNode {
      uid: uid.to_string(),
      key: manifest.key.clone(),
      manifest: manifest.clone(),
      owner_uids: owners.to_vec(),
      health,
      health_description: health_description.clone(),
      updated_at: now,
    };
    let nodes = if managing {
      &mut self.managing_nodes
    } else {
      &mut self.depended_nodes
    };
    let event_type = match nodes.insert(uid.to_string(), node) {
      Some(_) => EventType::Updated,
      None => EventType::Added,
    };
    self.touch(now);
    ResourceEvent {
      app_id: self.app_id.clone(),
      event_type,
      uid: uid.to_string(),
      key: manifest.key.clone(),
      owner_uids: owners.to_vec(),
      health,
      health_description,
      created_at: now,
    }
  }

  fn remove(&mut self, managing: bool, uid: &str, now: SystemTime) -> Option<ResourceEvent> {
    let nodes = if managing {
      &mut self.managing_nodes
    } else {
      &mut self.depended_nodes
    };
    let node = nodes.remove(uid)?;
    self.touch(now);
    Some(ResourceEvent {
      app_id: self.app_id.clone(),
      event_type: EventType::Deleted,
      uid: node.uid,
      key: node.key,
      owner_uids: node.owner_uids,
      health: node.health,
      health_description: node.health_description,
      created_at: now,
    })
  }

  /// Managing and depended nodes together.
  pub fn nodes(&self) -> Vec<&AppNode> {
    self.managing_nodes.values().chain(self.depended_nodes.values()).collect()
  }
}

#[derive(Debug, Clone)]
struct AppResource {
  app_id: String,
  owners: Vec<String>,
  manifest: Manifest,
}

#[derive(Debug, Default)]
struct Graph {
  apps: HashMap<String, AppNodes>,
  resources: HashMap<String, AppResource>,
}

impl Graph {
  /// First application id found by a depth-first walk over owner references.
  fn find_app_id_by_owners(&self, owners: &[String]) -> String {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = owners.iter().rev().map(String::as_str).collect();
    while let Some(uid) = stack.pop() {
      if !visited.insert(uid) {
        continue;
      }
      let Some(owner) = self.resources.get(uid) else {
        continue;
      };
      if !owner.app_id.is_empty() {
        return owner.app_id.clone();
      }
      stack.extend(owner.owners.iter().rev().map(String::as_str));
    }
    String::new()
  }
}

#[derive(Debug, Default)]
struct EventBuffer {
  events: Vec<ResourceEvent>,
  /// Iterator id to the index of its next unread event.
  cursors: HashMap<u64, usize>,
  next_iterator_id: u64,
}

impl EventBuffer {
  fn push(&mut self, event: ResourceEvent, soft_limit: usize, hard_limit: usize) {
    self.events.push(event);
    if self.events.len() < hard_limit {
      return;
    }
    let dropped = (hard_limit - soft_limit).min(self.events.len());
    self.discard_front(dropped);
  }

  fn discard_front(&mut self, num: usize) {
    if num == 0 {
      return;
    }
    self.events.drain(..num);
    for cursor in self.cursors.values_mut() {
      *cursor = cursor.saturating_sub(num);
    }
  }

  fn next(&mut self, iterator_id: u64, max: usize) -> Vec<ResourceEvent> {
    let len = self.events.len();
    let cursor = self.cursors.get(&iterator_id).copied().unwrap_or(0).min(len);
    let end = len.min(cursor.saturating_add(max));
    let out = self.events[cursor..end].to_vec();
    self.cursors.insert(iterator_id, end);

    // Everything every iterator has read can go.
    let consumed = self.cursors.values().copied().min().unwrap_or(0);
    self.discard_front(consumed);
    out
  }
}

/// Handle for reading events in order. Each iterator has its own cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventIterator {
  id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
  Pending,
  Ready,
  Failed(String),
}

/// Read access used by drift detection and pruning.
pub trait Getter: Send + Sync {
  /// Manifests of the resources directly managed by the application.
  fn get_app_live_manifests(&self, app_id: &str) -> Vec<Manifest>;

  /// Resource types being watched. Empty until discovery has run.
  fn watching_kinds(&self) -> Vec<ApiVersionKind>;
}

pub struct Store {
  graph: RwLock<Graph>,
  events: Mutex<EventBuffer>,
  soft_limit: usize,
  hard_limit: usize,
  ready: watch::Sender<Readiness>,
  watching: RwLock<Vec<ApiVersionKind>>,
}

impl Default for Store {
  fn default() -> Self {
    Self::new()
  }
}

impl Store {
  pub fn new() -> Self {
    Self::with_event_limits(DEFAULT_EVENTS_SOFT_LIMIT, DEFAULT_EVENTS_HARD_LIMIT)
  }

  /// Store whose event buffer drops the oldest `hard - soft` events when it
  /// reaches `hard` entries.
  pub fn with_event_limits(soft_limit: usize, hard_limit: usize) -> Self {
    let (ready, _) = watch::channel(Readiness::Pending);
    Self {
      graph: RwLock::new(Graph::default()),
      events: Mutex::new(EventBuffer::default()),
      soft_limit: soft_limit.min(hard_limit),
      hard_limit: hard_limit.max(1),
      ready,
      watching: RwLock::new(Vec::new()),
    }
  }

  pub fn set_watching_kinds(&self, kinds: Vec<ApiVersionKind>) {
    *self.watching.write() = kinds;
  }

  pub fn on_add(&self, manifest: Manifest) {
    self.place(manifest, false);
  }

  /// Same as [`Store::on_add`], but an object that lost its application
  /// annotation keeps the application it was attributed to before.
  pub fn on_update(&self, manifest: Manifest) {
    self.place(manifest, true);
  }

  fn place(&self, manifest: Manifest, is_update: bool) {
    let uid = manifest.uid().to_string();
    if uid.is_empty() {
      return;
    }
    let annotated = manifest.annotation(ANNOTATION_APPLICATION).unwrap_or_default().to_string();
    let owners = manifest.owner_uids();
    let now = SystemTime::now();

    let mut graph = self.graph.write();

    // Managed resources carry the application id and have no owners.
    if !annotated.is_empty() && owners.is_empty() {
      let event = graph
        .apps
        .entry(annotated.clone())
        .or_insert_with(|| AppNodes::new(&annotated, now))
        .put(true, &uid, &manifest, &owners, now);
      graph.resources.insert(
        uid,
        AppResource {
          app_id: annotated,
          owners,
          manifest,
        },
      );
      self.emit(event);
      return;
    }

    let mut app_id = String::new();
    if is_update {
      if let Some(previous) = graph.resources.get(&uid) {
        app_id = previous.app_id.clone();
      }
    }
    if app_id.is_empty() {
      app_id = graph.find_app_id_by_owners(&owners);
    }

    let event = graph
      .apps
      .get_mut(&app_id)
      .map(|app| app.put(false, &uid, &manifest, &owners, now));
    graph.resources.insert(
      uid,
      AppResource {
        app_id,
        owners,
        manifest,
      },
    );
    if let Some(event) = event {
      self.emit(event);
    }
  }

  pub fn on_delete(&self, manifest: &Manifest) {
    let uid = manifest.uid().to_string();
    let annotated = manifest.annotation(ANNOTATION_APPLICATION).unwrap_or_default().to_string();
    let owners = manifest.owner_uids();
    let now = SystemTime::now();

    let mut graph = self.graph.write();
    let recorded = graph.resources.remove(&uid);

    if !annotated.is_empty() && owners.is_empty() {
      if let Some(event) = graph.apps.get_mut(&annotated).and_then(|app| app.remove(true, &uid, now)) {
        self.emit(event);
      }
      return;
    }

    let app_id = match recorded {
      Some(r) if !r.app_id.is_empty() => r.app_id,
      _ => graph.find_app_id_by_owners(&owners),
    };
    if let Some(event) = graph.apps.get_mut(&app_id).and_then(|app| app.remove(false, &uid, now)) {
      self.emit(event);
    }
  }

  /// Called with the graph lock held so events keep placement order.
  fn emit(&self, event: ResourceEvent) {
    self.events.lock().push(event, self.soft_limit, self.hard_limit);
  }

  /// Attribute orphans after the first full listing, then mark the store
  /// ready.
  ///
  /// Objects arrive in no particular order during the initial listing, so
  /// children may have been seen before their owners.
  pub fn initialize(&self) {
    let mut guard = self.graph.write();
    let graph = &mut *guard;
    let now = SystemTime::now();

    let orphans: Vec<String> = graph
      .resources
      .iter()
      .filter(|(_, r)| r.app_id.is_empty())
      .map(|(uid, _)| uid.clone())
      .collect();
    let mut pending: Vec<(String, String)> = Vec::new();
    for uid in orphans {
      let Some(resource) = graph.resources.get(&uid) else {
        continue;
      };
      let app_id = graph.find_app_id_by_owners(&resource.owners);
      if !app_id.is_empty() {
        pending.push((uid, app_id));
      }
    }

    let mut attributed = 0;
    for (uid, app_id) in pending {
      let Some(resource) = graph.resources.get_mut(&uid) else {
        continue;
      };
      resource.app_id = app_id.clone();
      if let Some(app) = graph.apps.get_mut(&app_id) {
        app.put(false, &uid, &resource.manifest, &resource.owners, now);
      }
      attributed += 1;
      debug!(uid = %uid, app_id = %app_id, "attributed resource by owner references");
    }
    graph.resources.retain(|_, r| !r.app_id.is_empty());
    drop(guard);

    self.events.lock().events.clear();
    info!(attributed, "live state store has been initialized");
    self.ready.send_replace(Readiness::Ready);
  }

  /// Record that the first sync failed; waiters receive the error.
  pub fn fail(&self, message: impl Into<String>) {
    self.ready.send_replace(Readiness::Failed(message.into()));
  }

  pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), LiveStateError> {
    let mut rx = self.ready.subscribe();
    let waited = tokio::time::timeout(timeout, async {
      rx.wait_for(|r| *r != Readiness::Pending)
        .await
        .map(|r| r.clone())
    })
    .await;
    match waited {
      Err(_) => Err(LiveStateError::NotReady(timeout)),
      Ok(Err(_)) => Err(LiveStateError::Closed),
      Ok(Ok(Readiness::Failed(message))) => Err(LiveStateError::Sync(message)),
      Ok(Ok(_)) => Ok(()),
    }
  }

  pub fn is_ready(&self) -> bool {
    *self.ready.borrow() == Readiness::Ready
  }

  pub fn get_app_nodes(&self, app_id: &str) -> Option<AppNodes> {
    self.graph.read().apps.get(app_id).cloned()
  }

  pub fn app_ids(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.graph.read().apps.keys().cloned().collect();
    ids.sort();
    ids
  }

  pub fn new_event_iterator(&self) -> EventIterator {
    let mut events = self.events.lock();
    let id = events.next_iterator_id;
    events.next_iterator_id += 1;
    events.cursors.insert(id, 0);
    EventIterator { id }
  }

  /// Up to `max` events the iterator has not read yet.
  pub fn next_events(&self, iterator: &EventIterator, max: usize) -> Vec<ResourceEvent> {
    self.events.lock().next(iterator.id, max)
  }

  #[cfg(test)]
  fn buffered_events(&self) -> usize {
    self.events.lock().events.len()
  }
}

impl Getter for Store {
  fn get_app_live_manifests(&self, app_id: &str) -> Vec<Manifest> {
    let graph = self.graph.read();
    let Some(app) = graph.apps.get(app_id) else {
      return Vec::new();
    };
    let mut manifests: Vec<Manifest> = app.managing_nodes.values().map(|n| n.manifest.clone()).collect();
    manifests.sort_by(|a, b| a.key.cmp(&b.key));
    manifests
  }

  fn watching_kinds(&self) -> Vec<ApiVersionKind> {
    self.watching.read().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kubernetes::manifest::parse_manifests;

  fn object(kind: &str, name: &str, uid: &str, app: Option<&str>, owners: &[&str]) -> Manifest {
    let mut text = format!("apiVersion: v1\nkind: {}\nmetadata:\n  name: {}\n  namespace: default\n  uid: {}\n", kind, name, uid);
    if let Some(app) = app {
      text.push_str(&format!("  annotations:\n    pipecd.dev/application: {}\n", app));
    }
    if !owners.is_empty() {
      text.push_str("  ownerReferences:\n");
      for owner in owners {
        text.push_str(&format!("    - apiVersion: v1\n      kind: Owner\n      name: o\n      uid: {}\n", owner));
      }
    }
    parse_manifests(&text).unwrap().remove(0)
  }

  #[test]
  fn places_managed_and_depended_resources() {
    let store = Store::new();
    store.on_add(object("Deployment", "web", "d1", Some("app-1"), &[]));
    store.on_add(object("ReplicaSet", "web-abc", "rs1", None, &["d1"]));
    store.on_add(object("Pod", "web-abc-x", "p1", None, &["rs1"]));

    let app = store.get_app_nodes("app-1").unwrap();
    assert_eq!(app.managing_nodes.len(), 1);
    assert_eq!(app.depended_nodes.len(), 2);
    assert_eq!(app.version.increment, 3);
    assert_eq!(app.version.timestamp, app.updated_at);
    assert_eq!(store.get_app_live_manifests("app-1").len(), 1);
  }

  #[test]
  fn annotated_resource_with_owner_is_a_child() {
    let store = Store::new();
    store.on_add(object("Deployment", "web", "d1", Some("app-1"), &[]));
    // Controllers copy annotations onto children.
    store.on_add(object("ReplicaSet", "web-abc", "rs1", Some("app-1"), &["d1"]));

    let app = store.get_app_nodes("app-1").unwrap();
    assert_eq!(app.managing_nodes.len(), 1);
    assert!(app.depended_nodes.contains_key("rs1"));
  }

  #[test]
  fn initialize_attributes_children_seen_before_owners() {
    let store = Store::new();
    store.on_add(object("Pod", "web-abc-x", "p1", None, &["rs1"]));
    store.on_add(object("ReplicaSet", "web-abc", "rs1", None, &["d1"]));
    store.on_add(object("ConfigMap", "stray", "c1", None, &[]));
    store.on_add(object("Deployment", "web", "d1", Some("app-1"), &[]));
    assert!(store.buffered_events() > 0);

    store.initialize();
    assert!(store.is_ready());
    assert_eq!(store.buffered_events(), 0);
    let graph = store.graph.read();
    assert!(graph.resources.contains_key("p1"));
    assert!(graph.resources.contains_key("rs1"));
    assert!(!graph.resources.contains_key("c1"));
    drop(graph);

    let app = store.get_app_nodes("app-1").unwrap();
    assert_eq!(app.managing_nodes.len(), 1);
    let mut depended: Vec<&str> = app.depended_nodes.keys().map(String::as_str).collect();
    depended.sort();
    assert_eq!(depended, vec!["p1", "rs1"]);
    assert_eq!(app.depended_nodes["p1"].owner_uids, vec!["rs1".to_string()]);
    assert_eq!(store.get_app_live_manifests("app-1").len(), 1);
  }

  #[test]
  fn owner_cycles_terminate() {
    let store = Store::new();
    store.on_add(object("ReplicaSet", "a", "a1", None, &["b1"]));
    store.on_add(object("ReplicaSet", "b", "b1", None, &["a1"]));
    store.on_add(object("Pod", "p", "p1", None, &["a1"]));
    assert!(store.app_ids().is_empty());
  }

  #[test]
  fn update_keeps_previous_attribution() {
    let store = Store::new();
    store.on_add(object("Deployment", "web", "d1", Some("app-1"), &[]));
    store.on_add(object("ReplicaSet", "web-abc", "rs1", None, &["d1"]));
    // The owner went away but the child is still around.
    store.on_delete(&object("Deployment", "web", "d1", Some("app-1"), &[]));
    store.on_update(object("ReplicaSet", "web-abc", "rs1", None, &["d1"]));

    let app = store.get_app_nodes("app-1").unwrap();
    assert!(app.managing_nodes.is_empty());
    assert!(app.depended_nodes.contains_key("rs1"));
  }

  #[test]
  fn last_event_for_a_uid_wins() {
    let store = Store::new();
    let mut deployment = object("Deployment", "web", "d1", Some("app-1"), &[]);
    store.on_add(deployment.clone());
    deployment
      .set_nested_field(&["spec", "replicas"], serde_json::json!(4))
      .unwrap();
    store.on_update(deployment);

    let manifests = store.get_app_live_manifests("app-1");
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0].replicas(), Some(4));
  }

  #[test]
  fn events_are_read_per_iterator() {
    let store = Store::new();
    let first = store.new_event_iterator();
    let second = store.new_event_iterator();
    store.on_add(object("Deployment", "web", "d1", Some("app-1"), &[]));
    store.on_add(object("Service", "web", "s1", Some("app-1"), &[]));
    store.on_delete(&object("Service", "web", "s1", Some("app-1"), &[]));

    let events = store.next_events(&first, 2);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventType::Added);
    let rest = store.next_events(&first, 10);
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].event_type, EventType::Deleted);

    // The second iterator still sees everything; the buffer keeps it.
    assert_eq!(store.buffered_events(), 3);
    assert_eq!(store.next_events(&second, 10).len(), 3);
    assert_eq!(store.buffered_events(), 0);
  }

  #[test]
  fn hard_limit_drops_oldest_events() {
    let store = Store::with_event_limits(3, 5);
    let iterator = store.new_event_iterator();
    for i in 0..4 {
      store.on_add(object("ConfigMap", &format!("c{}", i), &format!("u{}", i), Some("app-1"), &[]));
    }
    assert_eq!(store.next_events(&iterator, 1).len(), 1);
    assert_eq!(store.buffered_events(), 3);

    store.on_add(object("ConfigMap", "c4", "u4", Some("app-1"), &[]));
    store.on_add(object("ConfigMap", "c5", "u5", Some("app-1"), &[]));
    // Reaching five entries dropped the two oldest.
    assert_eq!(store.buffered_events(), 3);
    let events = store.next_events(&iterator, 10);
    let names: Vec<&str> = events.iter().map(|e| e.key.name.as_str()).collect();
    assert_eq!(names, vec!["c3", "c4", "c5"]);
  }

  #[tokio::test]
  async fn wait_for_ready() {
    let store = Store::new();
    let err = store.wait_for_ready(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, LiveStateError::NotReady(_)));

    store.initialize();
    store.wait_for_ready(Duration::from_millis(10)).await.unwrap();

    let failed = Store::new();
    failed.fail("discovery failed");
    let err = failed.wait_for_ready(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, LiveStateError::Sync(_)));
  }
}
