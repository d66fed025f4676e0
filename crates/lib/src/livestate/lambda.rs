//! Periodically listed state of the managed Lambda functions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lambda::{FunctionManifest, LambdaClient, LambdaError};
use crate::livestate::LiveStateError;

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionState {
  pub manifest: FunctionManifest,
  pub synced_at: SystemTime,
}

/// Read access used by drift detection.
pub trait Getter: Send + Sync {
  fn get_function_manifest(&self, app_id: &str) -> Option<FunctionManifest>;
}

pub struct LambdaStore {
  client: Arc<dyn LambdaClient>,
  interval: Duration,
  functions: RwLock<HashMap<String, FunctionState>>,
  ready: watch::Sender<bool>,
}

impl LambdaStore {
  pub fn new(client: Arc<dyn LambdaClient>, interval: Duration) -> Self {
    let (ready, _) = watch::channel(false);
    Self {
      client,
      interval,
      functions: RwLock::new(HashMap::new()),
      ready,
    }
  }

  /// Replace the snapshot with a fresh listing.
  pub async fn refresh(&self) -> Result<usize, LambdaError> {
    let listed = self.client.list_managed_functions().await?;
    let now = SystemTime::now();
    let functions: HashMap<String, FunctionState> = listed
      .into_iter()
      .map(|f| {
        (
          f.app_id,
          FunctionState {
            manifest: f.manifest,
            synced_at: now,
          },
        )
      })
      .collect();
    let count = functions.len();
    *self.functions.write() = functions;
    self.ready.send_replace(true);
    Ok(count)
  }

  /// Refresh now and then on every interval tick until cancelled.
  pub async fn run(&self, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(self.interval);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = ticker.tick() => {}
      }
      match self.refresh().await {
        Ok(count) => info!(count, "refreshed lambda live state"),
        Err(e) => warn!(error = %e, "failed to list lambda functions"),
      }
    }
  }

  pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), LiveStateError> {
    let mut rx = self.ready.subscribe();
    match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
      Err(_) => Err(LiveStateError::NotReady(timeout)),
      Ok(Err(_)) => Err(LiveStateError::Closed),
      Ok(Ok(_)) => Ok(()),
    }
  }

  pub fn get_state(&self, app_id: &str) -> Option<FunctionState> {
    self.functions.read().get(app_id).cloned()
  }
}

impl Getter for LambdaStore {
  fn get_function_manifest(&self, app_id: &str) -> Option<FunctionManifest> {
    self.functions.read().get(app_id).map(|s| s.manifest.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::lambda::fake::FakeLambdaClient;
  use crate::lambda::parse_function_manifest;

  #[tokio::test]
  async fn refresh_indexes_by_application() {
    let client = Arc::new(FakeLambdaClient::new());
    let fm = parse_function_manifest(
      r#"
apiVersion: pipecd.dev/v1beta1
kind: LambdaFunction
spec:
  name: hello
  role: arn:aws:iam::123:role/lambda
  image: ecr/hello:v1
  memory: 128
  timeout: 5
  tags:
    pipecd-dev-application: app-1
"#,
    )
    .unwrap();
    client.create_function(&fm).await.unwrap();

    let store = LambdaStore::new(client, Duration::from_secs(60));
    assert!(store.wait_for_ready(Duration::from_millis(10)).await.is_err());
    assert_eq!(store.refresh().await.unwrap(), 1);
    store.wait_for_ready(Duration::from_millis(10)).await.unwrap();

    assert_eq!(store.get_function_manifest("app-1").unwrap().spec.name, "hello");
    assert!(store.get_state("app-2").is_none());
  }
}
