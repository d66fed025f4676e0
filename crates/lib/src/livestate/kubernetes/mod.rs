//! Live state of Kubernetes applications.

pub mod reflector;
pub mod store;

pub use reflector::{Reflector, kube_client};
pub use store::{AppNode, AppNodes, AppNodesVersion, EventIterator, EventType, Getter, ResourceEvent, Store};
