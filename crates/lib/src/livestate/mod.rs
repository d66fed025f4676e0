//! Live state of deployed applications, per platform provider.

pub mod kubernetes;
pub mod lambda;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::{PipedSpec, PlatformProviderConfig};
use crate::consts::DEFAULT_LAMBDA_SYNC_INTERVAL;
use crate::lambda::{AwsLambdaClient, LambdaError};

pub use self::kubernetes::Store as KubernetesStore;
pub use self::lambda::LambdaStore;

#[derive(Debug, Error)]
pub enum LiveStateError {
  #[error("live state is not ready after {0:?}")]
  NotReady(Duration),

  #[error("live state store was closed")]
  Closed,

  #[error("failed to sync live state: {0}")]
  Sync(String),

  #[error("failed to build kubernetes client: {0}")]
  Client(String),

  #[error(transparent)]
  Lambda(#[from] LambdaError),
}

/// Stores keyed by platform provider name.
#[derive(Default, Clone)]
pub struct LiveStates {
  kubernetes: HashMap<String, Arc<KubernetesStore>>,
  lambda: HashMap<String, Arc<LambdaStore>>,
}

impl LiveStates {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_kubernetes(&mut self, provider: impl Into<String>, store: Arc<KubernetesStore>) {
    self.kubernetes.insert(provider.into(), store);
  }

  pub fn add_lambda(&mut self, provider: impl Into<String>, store: Arc<LambdaStore>) {
    self.lambda.insert(provider.into(), store);
  }

  pub fn kubernetes(&self, provider: &str) -> Option<Arc<KubernetesStore>> {
    self.kubernetes.get(provider).cloned()
  }

  pub fn lambda(&self, provider: &str) -> Option<Arc<LambdaStore>> {
    self.lambda.get(provider).cloned()
  }

  /// Build a store for every configured provider and start feeding them.
  ///
  /// Background tasks stop when `cancel` fires.
  pub async fn start(
    spec: &PipedSpec,
    cancel: CancellationToken,
    tasks: &mut JoinSet<()>,
  ) -> Result<Self, LiveStateError> {
    let mut states = Self::new();
    for provider in &spec.platform_providers {
      match &provider.config {
        PlatformProviderConfig::Kubernetes(cfg) => {
          let client = self::kubernetes::kube_client(cfg).await?;
          let store = Arc::new(KubernetesStore::new());
          let reflector = self::kubernetes::Reflector::new(client, cfg.clone(), spec.piped_id.clone());
          let name = provider.name.clone();
          let feed = store.clone();
          let cancel = cancel.clone();
          tasks.spawn(async move {
            if let Err(e) = reflector.run(feed, cancel).await {
              error!(provider = %name, error = %e, "kubernetes live state stopped");
            }
          });
          states.add_kubernetes(&provider.name, store);
        }
        PlatformProviderConfig::Lambda(cfg) => {
          let client = Arc::new(AwsLambdaClient::new(cfg).await?);
          let store = Arc::new(LambdaStore::new(client, DEFAULT_LAMBDA_SYNC_INTERVAL));
          let feed = store.clone();
          let cancel = cancel.clone();
          tasks.spawn(async move { feed.run(cancel).await });
          states.add_lambda(&provider.name, store);
        }
      }
    }
    Ok(states)
  }
}
