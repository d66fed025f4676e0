//! AWS Lambda access.
//!
//! [`LambdaClient`] is the seam executors, planners and the live-state store
//! go through. [`AwsLambdaClient`] implements it with the AWS SDK; tests use
//! an in-memory fake.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};
use aws_config::web_identity_token::{StaticConfiguration, WebIdentityTokenCredentialsProvider};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_lambda::Client;
use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{
  AliasRoutingConfiguration, Architecture as AwsArchitecture, Environment, EphemeralStorage as AwsEphemeralStorage,
  FunctionCode, FunctionConfiguration, LastUpdateStatus, PackageType, Runtime, VpcConfig as AwsVpcConfig,
};
use thiserror::Error;
use tracing::{debug, warn};

use super::function::{
  Architecture, EphemeralStorage, FUNCTION_MANIFEST_KIND, FunctionManifest, FunctionManifestSpec, VERSION_V1BETA1,
  VpcConfig,
};
use crate::config::LambdaProviderConfig;
use crate::consts::{LAMBDA_SERVICE_ALIAS, LAMBDA_TAG_APPLICATION};

/// Attempts at updating a function configuration and at waiting for it to settle.
pub const REQUEST_RETRY_TIMES: usize = 3;
/// Pause between those attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LambdaError {
  #[error("lambda resource not found: {0}")]
  NotFound(String),

  #[error("invalid lambda client config: {0}")]
  Config(String),

  #[error("failed to {op} for Lambda function {name}: {message}")]
  Api {
    op: &'static str,
    name: String,
    message: String,
  },

  #[error("failed to update Lambda function {name}, status code {status}, error reason {reason}")]
  UpdateNotSettled { name: String, status: String, reason: String },

  #[error("invalid routing traffic configuration given: {0}")]
  InvalidTrafficConfig(String),
}

impl LambdaError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, LambdaError::NotFound(_))
  }
}

/// Share of alias traffic served by one function version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionTraffic {
  pub version: String,
  /// Percent in `[0, 100]`.
  pub percent: f64,
}

impl VersionTraffic {
  pub fn new(version: impl Into<String>, percent: f64) -> Self {
    Self {
      version: version.into(),
      percent,
    }
  }
}

/// Traffic split of the `Service` alias.
///
/// The primary is the alias's function version; the optional secondary is
/// the single additional version weight.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTrafficConfig {
  pub primary: VersionTraffic,
  pub secondary: Option<VersionTraffic>,
}

impl RoutingTrafficConfig {
  /// All traffic to `version`.
  pub fn all_to(version: impl Into<String>) -> Self {
    Self {
      primary: VersionTraffic::new(version, 100.0),
      secondary: None,
    }
  }

  /// Build from the alias's function version and additional weights
  /// (fractions in `[0, 1]`).
  pub fn from_alias(function_version: &str, weights: Option<&HashMap<String, f64>>) -> Self {
    let secondary = weights
      .and_then(|w| w.iter().next())
      .map(|(version, weight)| VersionTraffic::new(version.clone(), percentage_to_percent(*weight)));
    let primary_percent = 100.0 - secondary.as_ref().map_or(0.0, |s| s.percent);
    Self {
      primary: VersionTraffic::new(function_version, primary_percent),
      secondary,
    }
  }

  /// Additional version weights for the alias. Empty clears the routing.
  pub fn additional_weights(&self) -> HashMap<String, f64> {
    self
      .secondary
      .iter()
      .filter(|s| s.version != self.primary.version && s.percent > 0.0)
      .map(|s| (s.version.clone(), percent_to_percentage(s.percent)))
      .collect()
  }

  fn validate(&self) -> Result<(), LambdaError> {
    if self.primary.version.is_empty() {
      return Err(LambdaError::InvalidTrafficConfig("primary version not found".to_string()));
    }
    Ok(())
  }
}

fn percent_to_percentage(percent: f64) -> f64 {
  percent / 100.0
}

fn percentage_to_percent(weight: f64) -> f64 {
  (weight * 100.0 * 1000.0).round() / 1000.0
}

/// A function found in the account, with the application it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedFunction {
  pub app_id: String,
  pub manifest: FunctionManifest,
}

#[async_trait]
pub trait LambdaClient: Send + Sync {
  async fn is_function_exist(&self, name: &str) -> Result<bool, LambdaError>;

  async fn create_function(&self, fm: &FunctionManifest) -> Result<(), LambdaError>;

  /// Create a function whose code is the given zip archive.
  async fn create_function_from_source(&self, fm: &FunctionManifest, zip: Vec<u8>) -> Result<(), LambdaError>;

  /// Update configuration, wait for it to settle, then update code and tags.
  async fn update_function(&self, fm: &FunctionManifest) -> Result<(), LambdaError>;

  async fn update_function_from_source(&self, fm: &FunctionManifest, zip: Vec<u8>) -> Result<(), LambdaError>;

  /// Publish the current code and configuration, returning the version.
  async fn publish_function(&self, fm: &FunctionManifest) -> Result<String, LambdaError>;

  /// [`LambdaError::NotFound`] when the alias does not exist yet.
  async fn get_traffic_config(&self, fm: &FunctionManifest) -> Result<RoutingTrafficConfig, LambdaError>;

  async fn create_traffic_config(&self, fm: &FunctionManifest, version: &str) -> Result<(), LambdaError>;

  async fn update_traffic_config(&self, fm: &FunctionManifest, routing: &RoutingTrafficConfig) -> Result<(), LambdaError>;

  /// Functions tagged with an application id.
  async fn list_managed_functions(&self) -> Result<Vec<ManagedFunction>, LambdaError>;
}

/// Tags to add or overwrite and tag keys to remove.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TagChanges {
  pub added: BTreeMap<String, String>,
  pub updated: BTreeMap<String, String>,
  pub removed: Vec<String>,
}

impl TagChanges {
  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
  }
}

/// Compare the live tags of a function with the ones in its manifest.
pub fn tag_changes(remote: &HashMap<String, String>, defined: &BTreeMap<String, String>) -> TagChanges {
  let mut changes = TagChanges::default();
  for (key, value) in defined {
    match remote.get(key) {
      None => {
        changes.added.insert(key.clone(), value.clone());
      }
      Some(current) if current != value => {
        changes.updated.insert(key.clone(), value.clone());
      }
      Some(_) => {}
    }
  }
  let mut removed: Vec<String> = remote.keys().filter(|k| !defined.contains_key(*k)).cloned().collect();
  removed.sort();
  changes.removed = removed;
  changes
}

/// [`LambdaClient`] talking to AWS.
pub struct AwsLambdaClient {
  client: Client,
  retry_interval: Duration,
}

impl AwsLambdaClient {
  /// Resolve credentials and build a client.
  ///
  /// Credentials come from the SDK's default chain (environment, web
  /// identity, shared files, instance role), narrowed by the provider's
  /// credentials file, profile and role settings.
  pub async fn new(cfg: &LambdaProviderConfig) -> Result<Self, LambdaError> {
    if cfg.region.is_empty() {
      return Err(LambdaError::Config("region is required field".to_string()));
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));
    if !cfg.credentials_file.is_empty() {
      let files = ProfileFiles::builder()
        .include_default_config_file(true)
        .with_file(ProfileFileKind::Credentials, &cfg.credentials_file)
        .build();
      loader = loader.profile_files(files);
    }
    if !cfg.profile.is_empty() {
      loader = loader.profile_name(&cfg.profile);
    }
    if !cfg.token_file.is_empty() && !cfg.role_arn.is_empty() {
      let provider = WebIdentityTokenCredentialsProvider::builder()
        .static_configuration(StaticConfiguration {
          web_identity_token_file: PathBuf::from(&cfg.token_file),
          role_arn: cfg.role_arn.clone(),
          session_name: "piped".to_string(),
        })
        .build();
      loader = loader.credentials_provider(provider);
    }

    let sdk_config = loader.load().await;
    Ok(Self {
      client: Client::new(&sdk_config),
      retry_interval: RETRY_INTERVAL,
    })
  }

  fn api_error(op: &'static str, name: &str, err: impl std::error::Error) -> LambdaError {
    LambdaError::Api {
      op,
      name: name.to_string(),
      message: DisplayErrorContext(err).to_string(),
    }
  }

  async fn update_function_configuration(&self, fm: &FunctionManifest) -> Result<(), LambdaError> {
    let spec = &fm.spec;
    let mut last_err = None;
    for attempt in 0..REQUEST_RETRY_TIMES {
      if attempt > 0 {
        tokio::time::sleep(self.retry_interval).await;
      }
      let mut request = self
        .client
        .update_function_configuration()
        .function_name(&spec.name)
        .role(&spec.role)
        .memory_size(spec.memory)
        .timeout(spec.timeout)
        .environment(environment(spec));
      if !spec.runtime.is_empty() {
        request = request.runtime(Runtime::from(spec.runtime.as_str()));
      }
      if !spec.handler.is_empty() {
        request = request.handler(&spec.handler);
      }
      if let Some(storage) = ephemeral_storage(spec)? {
        request = request.ephemeral_storage(storage);
      }
      if let Some(vpc) = vpc_config(spec) {
        request = request.vpc_config(vpc);
      }
      if !spec.layers.is_empty() {
        request = request.set_layers(Some(spec.layers.clone()));
      }

      match request.send().await {
        Ok(_) => {
          last_err = None;
          break;
        }
        Err(err) => {
          warn!(function = %spec.name, attempt, "failed to update function configuration");
          last_err = Some(Self::api_error("update configuration", &spec.name, err));
        }
      }
    }
    if let Some(err) = last_err {
      return Err(err);
    }

    self.wait_for_update(&spec.name).await
  }

  /// Poll until the last update reports `Successful`.
  async fn wait_for_update(&self, name: &str) -> Result<(), LambdaError> {
    let mut last_err = LambdaError::UpdateNotSettled {
      name: name.to_string(),
      status: "Unknown".to_string(),
      reason: String::new(),
    };
    for attempt in 0..REQUEST_RETRY_TIMES {
      if attempt > 0 {
        tokio::time::sleep(self.retry_interval).await;
      }
      let output = match self.client.get_function().function_name(name).send().await {
        Ok(output) => output,
        Err(err) => {
          last_err = Self::api_error("get function", name, err);
          continue;
        }
      };
      let configuration = output.configuration();
      let status = configuration.and_then(|c| c.last_update_status());
      if status == Some(&LastUpdateStatus::Successful) {
        return Ok(());
      }
      last_err = LambdaError::UpdateNotSettled {
        name: name.to_string(),
        status: status.map_or("Unknown", |s| s.as_str()).to_string(),
        reason: configuration
          .and_then(|c| c.last_update_status_reason())
          .unwrap_or_default()
          .to_string(),
      };
      debug!(function = %name, attempt, "function update still in progress");
    }
    Err(last_err)
  }

  async fn update_tags(&self, fm: &FunctionManifest) -> Result<(), LambdaError> {
    let name = &fm.spec.name;
    let output = self
      .client
      .get_function()
      .function_name(name)
      .send()
      .await
      .map_err(|e| Self::api_error("list tags", name, e))?;
    let arn = output
      .configuration()
      .and_then(|c| c.function_arn())
      .unwrap_or_default()
      .to_string();
    let empty = HashMap::new();
    let changes = tag_changes(output.tags().unwrap_or(&empty), &fm.spec.tags);
    if changes.is_empty() {
      return Ok(());
    }

    let mut upserts = changes.added;
    upserts.extend(changes.updated);
    if !upserts.is_empty() {
      self
        .client
        .tag_resource()
        .resource(&arn)
        .set_tags(Some(upserts.into_iter().collect()))
        .send()
        .await
        .map_err(|e| Self::api_error("tag function", name, e))?;
    }
    if !changes.removed.is_empty() {
      self
        .client
        .untag_resource()
        .resource(&arn)
        .set_tag_keys(Some(changes.removed))
        .send()
        .await
        .map_err(|e| Self::api_error("untag function", name, e))?;
    }
    Ok(())
  }

  async fn update_code(&self, fm: &FunctionManifest, zip: Option<Vec<u8>>) -> Result<(), LambdaError> {
    let spec = &fm.spec;
    let mut request = self.client.update_function_code().function_name(&spec.name);
    match zip {
      Some(data) => request = request.zip_file(Blob::new(data)),
      None => {
        if !spec.image.is_empty() {
          request = request.image_uri(&spec.image);
        }
        if !spec.s3_bucket.is_empty() {
          request = request
            .s3_bucket(&spec.s3_bucket)
            .s3_key(&spec.s3_key)
            .s3_object_version(&spec.s3_object_version);
        }
      }
    }
    if !spec.architectures.is_empty() {
      request = request.set_architectures(Some(architectures(spec)));
    }
    request
      .send()
      .await
      .map_err(|e| Self::api_error("update function code", &spec.name, e))?;
    Ok(())
  }

  async fn create(&self, fm: &FunctionManifest, code: FunctionCode, package: PackageType) -> Result<(), LambdaError> {
    let spec = &fm.spec;
    let mut request = self
      .client
      .create_function()
      .function_name(&spec.name)
      .role(&spec.role)
      .memory_size(spec.memory)
      .timeout(spec.timeout)
      .set_tags(Some(spec.tags.clone().into_iter().collect()))
      .environment(environment(spec))
      .package_type(package.clone())
      .code(code);
    if !spec.architectures.is_empty() {
      request = request.set_architectures(Some(architectures(spec)));
    }
    if let Some(storage) = ephemeral_storage(spec)? {
      request = request.ephemeral_storage(storage);
    }
    if let Some(vpc) = vpc_config(spec) {
      request = request.vpc_config(vpc);
    }
    if package == PackageType::Zip {
      request = request.handler(&spec.handler).runtime(Runtime::from(spec.runtime.as_str()));
      if !spec.layers.is_empty() {
        request = request.set_layers(Some(spec.layers.clone()));
      }
    }
    request
      .send()
      .await
      .map_err(|e| Self::api_error("create function", &spec.name, e))?;
    Ok(())
  }
}

fn environment(spec: &FunctionManifestSpec) -> Environment {
  Environment::builder()
    .set_variables(Some(spec.environments.clone().into_iter().collect()))
    .build()
}

fn architectures(spec: &FunctionManifestSpec) -> Vec<AwsArchitecture> {
  spec
    .architectures
    .iter()
    .map(|a| AwsArchitecture::from(a.name.as_str()))
    .collect()
}

fn ephemeral_storage(spec: &FunctionManifestSpec) -> Result<Option<AwsEphemeralStorage>, LambdaError> {
  match &spec.ephemeral_storage {
    Some(storage) if storage.size != 0 => AwsEphemeralStorage::builder()
      .size(storage.size)
      .build()
      .map(Some)
      .map_err(|e| LambdaError::Config(e.to_string())),
    _ => Ok(None),
  }
}

fn vpc_config(spec: &FunctionManifestSpec) -> Option<AwsVpcConfig> {
  spec.vpc_config.as_ref().map(|vpc| {
    AwsVpcConfig::builder()
      .set_security_group_ids(Some(vpc.security_group_ids.clone()))
      .set_subnet_ids(Some(vpc.subnet_ids.clone()))
      .build()
  })
}

/// Function manifest as the live configuration describes it.
fn manifest_from_configuration(configuration: &FunctionConfiguration, tags: BTreeMap<String, String>) -> FunctionManifest {
  let spec = FunctionManifestSpec {
    name: configuration.function_name().unwrap_or_default().to_string(),
    role: configuration.role().unwrap_or_default().to_string(),
    handler: configuration.handler().unwrap_or_default().to_string(),
    runtime: configuration.runtime().map(|r| r.as_str().to_string()).unwrap_or_default(),
    memory: configuration.memory_size().unwrap_or_default(),
    timeout: configuration.timeout().unwrap_or_default(),
    architectures: configuration
      .architectures()
      .iter()
      .map(|a| Architecture {
        name: a.as_str().to_string(),
      })
      .collect(),
    ephemeral_storage: configuration.ephemeral_storage().map(|s| EphemeralStorage { size: s.size() }),
    environments: configuration
      .environment()
      .and_then(|e| e.variables())
      .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
      .unwrap_or_default(),
    vpc_config: configuration.vpc_config().and_then(|vpc| {
      if vpc.subnet_ids().is_empty() && vpc.security_group_ids().is_empty() {
        return None;
      }
      Some(VpcConfig {
        security_group_ids: vpc.security_group_ids().to_vec(),
        subnet_ids: vpc.subnet_ids().to_vec(),
      })
    }),
    layers: configuration
      .layers()
      .iter()
      .filter_map(|l| l.arn().map(str::to_string))
      .collect(),
    tags,
    ..Default::default()
  };
  FunctionManifest {
    kind: FUNCTION_MANIFEST_KIND.to_string(),
    api_version: VERSION_V1BETA1.to_string(),
    spec,
  }
}

#[async_trait]
impl LambdaClient for AwsLambdaClient {
  async fn is_function_exist(&self, name: &str) -> Result<bool, LambdaError> {
    match self.client.get_function().function_name(name).send().await {
      Ok(_) => Ok(true),
      Err(err) => {
        if err
          .as_service_error()
          .is_some_and(|e| e.is_resource_not_found_exception())
        {
          return Ok(false);
        }
        Err(Self::api_error("get function", name, err))
      }
    }
  }

  async fn create_function(&self, fm: &FunctionManifest) -> Result<(), LambdaError> {
    let spec = &fm.spec;
    if !spec.image.is_empty() {
      let code = FunctionCode::builder().image_uri(&spec.image).build();
      return self.create(fm, code, PackageType::Image).await;
    }
    let code = FunctionCode::builder()
      .s3_bucket(&spec.s3_bucket)
      .s3_key(&spec.s3_key)
      .s3_object_version(&spec.s3_object_version)
      .build();
    self.create(fm, code, PackageType::Zip).await
  }

  async fn create_function_from_source(&self, fm: &FunctionManifest, zip: Vec<u8>) -> Result<(), LambdaError> {
    let code = FunctionCode::builder().zip_file(Blob::new(zip)).build();
    self.create(fm, code, PackageType::Zip).await
  }

  async fn update_function(&self, fm: &FunctionManifest) -> Result<(), LambdaError> {
    // Lambda rejects a code update while a configuration update is pending.
    self.update_function_configuration(fm).await?;
    self.update_code(fm, None).await?;
    self.update_tags(fm).await
  }

  async fn update_function_from_source(&self, fm: &FunctionManifest, zip: Vec<u8>) -> Result<(), LambdaError> {
    self.update_function_configuration(fm).await?;
    self.update_code(fm, Some(zip)).await?;
    self.update_tags(fm).await
  }

  async fn publish_function(&self, fm: &FunctionManifest) -> Result<String, LambdaError> {
    let output = self
      .client
      .publish_version()
      .function_name(&fm.spec.name)
      .send()
      .await
      .map_err(|e| Self::api_error("publish new version", &fm.spec.name, e))?;
    Ok(output.version().unwrap_or_default().to_string())
  }

  async fn get_traffic_config(&self, fm: &FunctionManifest) -> Result<RoutingTrafficConfig, LambdaError> {
    let output = self
      .client
      .get_alias()
      .function_name(&fm.spec.name)
      .name(LAMBDA_SERVICE_ALIAS)
      .send()
      .await
      .map_err(|err| {
        if err
          .as_service_error()
          .is_some_and(|e| e.is_resource_not_found_exception())
        {
          return LambdaError::NotFound(format!("alias {} of {}", LAMBDA_SERVICE_ALIAS, fm.spec.name));
        }
        Self::api_error("get traffic config", &fm.spec.name, err)
      })?;

    Ok(RoutingTrafficConfig::from_alias(
      output.function_version().unwrap_or_default(),
      output.routing_config().and_then(|r| r.additional_version_weights()),
    ))
  }

  async fn create_traffic_config(&self, fm: &FunctionManifest, version: &str) -> Result<(), LambdaError> {
    self
      .client
      .create_alias()
      .function_name(&fm.spec.name)
      .function_version(version)
      .name(LAMBDA_SERVICE_ALIAS)
      .send()
      .await
      .map_err(|e| Self::api_error("create traffic config", &fm.spec.name, e))?;
    Ok(())
  }

  async fn update_traffic_config(&self, fm: &FunctionManifest, routing: &RoutingTrafficConfig) -> Result<(), LambdaError> {
    routing.validate()?;
    let routing_config = AliasRoutingConfiguration::builder()
      .set_additional_version_weights(Some(routing.additional_weights()))
      .build();
    self
      .client
      .update_alias()
      .function_name(&fm.spec.name)
      .name(LAMBDA_SERVICE_ALIAS)
      .function_version(&routing.primary.version)
      .routing_config(routing_config)
      .send()
      .await
      .map_err(|e| Self::api_error("update traffic config", &fm.spec.name, e))?;
    Ok(())
  }

  async fn list_managed_functions(&self) -> Result<Vec<ManagedFunction>, LambdaError> {
    let mut functions = Vec::new();
    let mut marker: Option<String> = None;
    loop {
      let page = self
        .client
        .list_functions()
        .set_marker(marker.take())
        .send()
        .await
        .map_err(|e| Self::api_error("list functions", "*", e))?;

      for listed in page.functions() {
        let Some(name) = listed.function_name() else {
          continue;
        };
        let output = self
          .client
          .get_function()
          .function_name(name)
          .send()
          .await
          .map_err(|e| Self::api_error("get function", name, e))?;
        let tags: BTreeMap<String, String> = output
          .tags()
          .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
          .unwrap_or_default();
        let Some(app_id) = tags.get(LAMBDA_TAG_APPLICATION).cloned() else {
          continue;
        };
        let configuration = output.configuration().unwrap_or(listed);
        let mut manifest = manifest_from_configuration(configuration, tags);
        manifest.spec.image = output
          .code()
          .and_then(|c| c.image_uri())
          .unwrap_or_default()
          .to_string();
        functions.push(ManagedFunction { app_id, manifest });
      }

      match page.next_marker() {
        Some(next) if !next.is_empty() => marker = Some(next.to_string()),
        _ => break,
      }
    }
    Ok(functions)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn traffic_from_alias_without_routing() {
    let cfg = RoutingTrafficConfig::from_alias("3", None);
    assert_eq!(cfg, RoutingTrafficConfig::all_to("3"));
  }

  #[test]
  fn traffic_from_alias_with_secondary() {
    let weights = HashMap::from([("3".to_string(), 0.9)]);
    let cfg = RoutingTrafficConfig::from_alias("1", Some(&weights));
    assert_eq!(cfg.primary, VersionTraffic::new("1", 10.0));
    assert_eq!(cfg.secondary, Some(VersionTraffic::new("3", 90.0)));
  }

  #[test]
  fn primary_weight_round_trips_through_alias() {
    for p in 0..=100 {
      let routing = RoutingTrafficConfig {
        primary: VersionTraffic::new("2", p as f64),
        secondary: Some(VersionTraffic::new("1", (100 - p) as f64)),
      };
      let weights = routing.additional_weights();
      let back = RoutingTrafficConfig::from_alias("2", Some(&weights));
      assert_eq!(back.primary.percent, p as f64, "p = {}", p);
      if p < 100 {
        assert_eq!(back.secondary.unwrap().percent, (100 - p) as f64);
      } else {
        assert!(back.secondary.is_none());
      }
    }
  }

  #[test]
  fn missing_primary_is_rejected() {
    let routing = RoutingTrafficConfig::all_to("");
    assert!(matches!(routing.validate(), Err(LambdaError::InvalidTrafficConfig(_))));
  }

  #[test]
  fn tag_changes_split_added_updated_removed() {
    let remote = HashMap::from([
      ("keep".to_string(), "1".to_string()),
      ("change".to_string(), "old".to_string()),
      ("drop".to_string(), "x".to_string()),
    ]);
    let defined = BTreeMap::from([
      ("keep".to_string(), "1".to_string()),
      ("change".to_string(), "new".to_string()),
      ("add".to_string(), "y".to_string()),
    ]);
    let changes = tag_changes(&remote, &defined);
    assert_eq!(changes.added, BTreeMap::from([("add".to_string(), "y".to_string())]));
    assert_eq!(changes.updated, BTreeMap::from([("change".to_string(), "new".to_string())]));
    assert_eq!(changes.removed, vec!["drop".to_string()]);

    let same = tag_changes(&HashMap::from([("keep".to_string(), "1".to_string())]), &BTreeMap::from([("keep".to_string(), "1".to_string())]));
    assert!(same.is_empty());
  }

  #[tokio::test]
  async fn region_is_required() {
    let err = AwsLambdaClient::new(&LambdaProviderConfig::default()).await.err().unwrap();
    assert!(matches!(err, LambdaError::Config(_)));
  }
}
