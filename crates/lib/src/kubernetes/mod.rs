//! Kubernetes platform support.
//!
//! Manifest model and loading, the external tool wrappers (`kubectl`,
//! `kustomize`, `helm`), the applier used by executors, manifest diffs and
//! live-resource health.

pub mod applier;
pub mod config_hash;
pub mod diff;
pub mod health;
pub mod helm;
pub mod kubectl;
pub mod kustomize;
pub mod loader;
pub mod manifest;
pub mod resource_key;

pub use applier::{Applier, KubectlApplier};
pub use diff::{DiffListResult, DiffRenderOptions, diff_list};
pub use kubectl::{Kubectl, KubectlError};
pub use loader::{Loader, LoaderError, LoaderInput, NamespaceScopes};
pub use manifest::{Manifest, ManifestError};
pub use resource_key::{ApiVersionKind, ResourceKey};
