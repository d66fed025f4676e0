//! In-memory [`LambdaClient`] for tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{LambdaClient, LambdaError, ManagedFunction, RoutingTrafficConfig};
use super::function::FunctionManifest;
use crate::consts::LAMBDA_TAG_APPLICATION;

#[derive(Debug, Default)]
struct FakeFunction {
  manifest: FunctionManifest,
  zip: Option<Vec<u8>>,
  published: Vec<FunctionManifest>,
  /// Alias function version and additional weights, as AWS stores them.
  alias: Option<(String, HashMap<String, f64>)>,
}

/// Functions and aliases kept in memory, with a log of mutating calls.
#[derive(Debug, Default)]
pub struct FakeLambdaClient {
  functions: Mutex<BTreeMap<String, FakeFunction>>,
  calls: Mutex<Vec<String>>,
}

impl FakeLambdaClient {
  pub fn new() -> Self {
    Self::default()
  }

  /// Mutating calls in order, e.g. `create f`, `publish f 1`.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().clone()
  }

  pub fn function(&self, name: &str) -> Option<FunctionManifest> {
    self.functions.lock().get(name).map(|f| f.manifest.clone())
  }

  pub fn published_versions(&self, name: &str) -> usize {
    self.functions.lock().get(name).map_or(0, |f| f.published.len())
  }

  pub fn source_zip(&self, name: &str) -> Option<Vec<u8>> {
    self.functions.lock().get(name).and_then(|f| f.zip.clone())
  }

  fn record(&self, call: String) {
    self.calls.lock().push(call);
  }

  fn upsert(&self, fm: &FunctionManifest, zip: Option<Vec<u8>>, must_exist: bool) -> Result<(), LambdaError> {
    let mut functions = self.functions.lock();
    if must_exist && !functions.contains_key(&fm.spec.name) {
      return Err(LambdaError::NotFound(fm.spec.name.clone()));
    }
    let entry = functions.entry(fm.spec.name.clone()).or_default();
    entry.manifest = fm.clone();
    entry.zip = zip;
    Ok(())
  }
}

#[async_trait]
impl LambdaClient for FakeLambdaClient {
  async fn is_function_exist(&self, name: &str) -> Result<bool, LambdaError> {
    Ok(self.functions.lock().contains_key(name))
  }

  async fn create_function(&self, fm: &FunctionManifest) -> Result<(), LambdaError> {
    self.record(format!("create {}", fm.spec.name));
    self.upsert(fm, None, false)
  }

  async fn create_function_from_source(&self, fm: &FunctionManifest, zip: Vec<u8>) -> Result<(), LambdaError> {
    self.record(format!("create {} from source", fm.spec.name));
    self.upsert(fm, Some(zip), false)
  }

  async fn update_function(&self, fm: &FunctionManifest) -> Result<(), LambdaError> {
    self.record(format!("update {}", fm.spec.name));
    self.upsert(fm, None, true)
  }

  async fn update_function_from_source(&self, fm: &FunctionManifest, zip: Vec<u8>) -> Result<(), LambdaError> {
    self.record(format!("update {} from source", fm.spec.name));
    self.upsert(fm, Some(zip), true)
  }

  async fn publish_function(&self, fm: &FunctionManifest) -> Result<String, LambdaError> {
    let mut functions = self.functions.lock();
    let function = functions
      .get_mut(&fm.spec.name)
      .ok_or_else(|| LambdaError::NotFound(fm.spec.name.clone()))?;
    let snapshot = function.manifest.clone();
    function.published.push(snapshot);
    let version = function.published.len().to_string();
    drop(functions);
    self.record(format!("publish {} {}", fm.spec.name, version));
    Ok(version)
  }

  async fn get_traffic_config(&self, fm: &FunctionManifest) -> Result<RoutingTrafficConfig, LambdaError> {
    let functions = self.functions.lock();
    let (version, weights) = functions
      .get(&fm.spec.name)
      .and_then(|f| f.alias.as_ref())
      .ok_or_else(|| LambdaError::NotFound(fm.spec.name.clone()))?;
    Ok(RoutingTrafficConfig::from_alias(version, Some(weights)))
  }

  async fn create_traffic_config(&self, fm: &FunctionManifest, version: &str) -> Result<(), LambdaError> {
    let mut functions = self.functions.lock();
    let function = functions
      .get_mut(&fm.spec.name)
      .ok_or_else(|| LambdaError::NotFound(fm.spec.name.clone()))?;
    function.alias = Some((version.to_string(), HashMap::new()));
    drop(functions);
    self.record(format!("create alias {} {}", fm.spec.name, version));
    Ok(())
  }

  async fn update_traffic_config(&self, fm: &FunctionManifest, routing: &RoutingTrafficConfig) -> Result<(), LambdaError> {
    if routing.primary.version.is_empty() {
      return Err(LambdaError::InvalidTrafficConfig("primary version not found".to_string()));
    }
    let mut functions = self.functions.lock();
    let function = functions
      .get_mut(&fm.spec.name)
      .ok_or_else(|| LambdaError::NotFound(fm.spec.name.clone()))?;
    if function.alias.is_none() {
      return Err(LambdaError::NotFound(fm.spec.name.clone()));
    }
    function.alias = Some((routing.primary.version.clone(), routing.additional_weights()));
    drop(functions);
    self.record(format!("update alias {} {}", fm.spec.name, routing.primary.version));
    Ok(())
  }

  async fn list_managed_functions(&self) -> Result<Vec<ManagedFunction>, LambdaError> {
    Ok(
      self
        .functions
        .lock()
        .values()
        .filter_map(|f| {
          let app_id = f.manifest.spec.tags.get(LAMBDA_TAG_APPLICATION)?;
          Some(ManagedFunction {
            app_id: app_id.clone(),
            manifest: f.manifest.clone(),
          })
        })
        .collect(),
    )
  }
}
