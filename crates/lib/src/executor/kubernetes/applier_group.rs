//! Routing manifests to the cluster they belong to.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{KubernetesApplicationSpec, KubernetesResourceRouteMatcher};
use crate::executor::{ExecutorError, PlatformClients};
use crate::kubernetes::applier::replace_or_create;
use crate::kubernetes::{Applier, KubectlError, Manifest, ResourceKey};

#[derive(Debug, Error)]
pub enum ApplyError {
  #[error("no platform provider matches {0}")]
  NoRoute(String),

  #[error(transparent)]
  Kubectl(#[from] KubectlError),
}

impl ApplyError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, ApplyError::Kubectl(e) if e.is_not_found())
  }
}

struct Route {
  matcher: Option<KubernetesResourceRouteMatcher>,
  provider: String,
}

impl Route {
  fn matches(&self, kind: &str, name: &str) -> bool {
    let Some(matcher) = &self.matcher else {
      return true;
    };
    (matcher.kind.is_empty() || matcher.kind == kind) && (matcher.name.is_empty() || matcher.name == name)
  }
}

/// Picks an applier per resource.
///
/// Routes are tried in order; the first one whose kind and name match wins.
/// Resources no route claims go to the application's own provider.
pub struct ApplierGroup {
  routes: Vec<Route>,
  default_provider: String,
  appliers: HashMap<String, Arc<dyn Applier>>,
}

impl ApplierGroup {
  pub fn new(
    spec: &KubernetesApplicationSpec,
    default_provider: &str,
    clients: &dyn PlatformClients,
  ) -> Result<Self, ExecutorError> {
    let routes: Vec<Route> = spec
      .resource_routes
      .iter()
      .map(|r| Route {
        matcher: r.matcher.clone(),
        provider: r.provider.name.clone(),
      })
      .collect();

    let mut appliers = HashMap::new();
    let providers = routes
      .iter()
      .map(|r| r.provider.as_str())
      .chain(std::iter::once(default_provider))
      .filter(|p| !p.is_empty());
    for provider in providers {
      if appliers.contains_key(provider) {
        continue;
      }
      let applier = clients.kubernetes_applier(provider, &spec.input)?;
      appliers.insert(provider.to_string(), applier);
    }

    Ok(Self {
      routes,
      default_provider: default_provider.to_string(),
      appliers,
    })
  }

  fn applier(&self, key: &ResourceKey) -> Result<&Arc<dyn Applier>, ApplyError> {
    let provider = self
      .routes
      .iter()
      .find(|r| r.matches(&key.kind, &key.name))
      .map(|r| r.provider.as_str())
      .unwrap_or(self.default_provider.as_str());
    self
      .appliers
      .get(provider)
      .ok_or_else(|| ApplyError::NoRoute(key.readable_string()))
  }

  pub async fn apply_manifest(&self, manifest: &Manifest) -> Result<(), ApplyError> {
    Ok(self.applier(&manifest.key)?.apply_manifest(manifest).await?)
  }

  pub async fn replace_or_create(&self, manifest: &Manifest) -> Result<(), ApplyError> {
    Ok(replace_or_create(self.applier(&manifest.key)?.as_ref(), manifest).await?)
  }

  pub async fn delete(&self, key: &ResourceKey) -> Result<(), ApplyError> {
    Ok(self.applier(key)?.delete(key).await?)
  }
}
