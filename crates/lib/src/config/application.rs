use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ConfigError, K8sPrimaryRolloutStageOptions, K8sSyncStageOptions, StageName, load_yaml};
use crate::consts::{
  DEFAULT_BASELINE_VARIANT, DEFAULT_CANARY_VARIANT, DEFAULT_FUNCTION_MANIFEST_FILENAME, DEFAULT_PRIMARY_VARIANT,
  DEFAULT_VARIANT_LABEL,
};

pub const KIND_KUBERNETES_APP: &str = "KubernetesApp";
pub const KIND_LAMBDA_APP: &str = "LambdaApp";

/// An application configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
  #[serde(default)]
  pub api_version: String,
  pub kind: String,
  pub spec: serde_yaml::Value,
}

impl ApplicationConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    load_yaml(path)
  }

  pub fn kubernetes_spec(&self) -> Result<KubernetesApplicationSpec, ConfigError> {
    self.typed_spec(KIND_KUBERNETES_APP)
  }

  pub fn lambda_spec(&self) -> Result<LambdaApplicationSpec, ConfigError> {
    self.typed_spec(KIND_LAMBDA_APP)
  }

  fn typed_spec<T: for<'de> Deserialize<'de>>(&self, expected: &str) -> Result<T, ConfigError> {
    if self.kind != expected {
      return Err(ConfigError::UnexpectedKind {
        expected: expected.to_string(),
        actual: self.kind.clone(),
      });
    }
    serde_yaml::from_value(self.spec.clone()).map_err(|source| ConfigError::Spec {
      kind: expected.to_string(),
      source,
    })
  }
}

/// Load the application configuration in `app_dir`.
pub fn load_application_config(app_dir: &Path, filename: &str) -> Result<ApplicationConfig, ConfigError> {
  ApplicationConfig::load(&app_dir.join(filename))
}

/// Fields every application kind shares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenericApplicationSpec {
  pub name: String,
  pub labels: BTreeMap<String, String>,
  pub description: String,
  pub planner: DeploymentPlanner,
  pub pipeline: Option<DeploymentPipeline>,
  pub encryption: Option<SecretEncryption>,
  pub attachment: Option<Attachment>,
  pub drift_detection: Option<DriftDetection>,
}

impl GenericApplicationSpec {
  pub fn has_stage(&self, name: StageName) -> bool {
    self
      .pipeline
      .as_ref()
      .is_some_and(|p| p.stages.iter().any(|s| s.name == name))
  }

  pub fn stage(&self, index: usize) -> Option<&PipelineStage> {
    self.pipeline.as_ref().and_then(|p| p.stages.get(index))
  }

  /// Whether source files are rewritten before loading manifests.
  pub fn mutates_sources(&self) -> bool {
    self.encryption.as_ref().is_some_and(|e| !e.decryption_targets.is_empty())
      || self.attachment.as_ref().is_some_and(|a| !a.targets.is_empty())
  }

  pub fn ignore_fields(&self) -> &[String] {
    self
      .drift_detection
      .as_ref()
      .map(|d| d.ignore_fields.as_slice())
      .unwrap_or_default()
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentPlanner {
  /// Always use the configured pipeline instead of auto-detecting.
  pub always_use_pipeline: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentPipeline {
  pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
  #[serde(default)]
  pub id: String,
  pub name: StageName,
  #[serde(default)]
  pub desc: String,
  /// Raw stage options, decoded per stage by [`PipelineStage::options`].
  #[serde(default)]
  pub with: serde_yaml::Value,
}

impl PipelineStage {
  pub fn new(name: StageName) -> Self {
    Self {
      id: String::new(),
      name,
      desc: String::new(),
      with: serde_yaml::Value::Null,
    }
  }

  pub fn with_options<T: Serialize>(mut self, options: &T) -> Self {
    self.with = serde_yaml::to_value(options).unwrap_or(serde_yaml::Value::Null);
    self
  }

  /// Decode the stage options, falling back to defaults when none are given.
  pub fn options<T: Default + for<'de> Deserialize<'de>>(&self) -> Result<T, ConfigError> {
    if self.with.is_null() {
      return Ok(T::default());
    }
    serde_yaml::from_value(self.with.clone()).map_err(|source| ConfigError::StageOptions {
      stage: self.name.to_string(),
      source,
    })
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretEncryption {
  pub encrypted_secrets: BTreeMap<String, String>,
  pub decryption_targets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attachment {
  /// Name to source file path, relative to the application directory.
  pub sources: BTreeMap<String, String>,
  pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriftDetection {
  /// Entries of the form `apiVersion:kind:namespace:name#field.path`.
  pub ignore_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesApplicationSpec {
  #[serde(flatten)]
  pub generic: GenericApplicationSpec,
  pub input: KubernetesDeploymentInput,
  pub quick_sync: K8sSyncStageOptions,
  /// Which Service is the application's service. Empty picks the first one.
  pub service: K8sResourceReference,
  /// Which resources are workloads. Empty means every Deployment.
  pub workloads: Vec<K8sResourceReference>,
  pub traffic_routing: Option<KubernetesTrafficRouting>,
  pub variant_label: KubernetesVariantLabel,
  pub resource_routes: Vec<KubernetesResourceRoute>,
}

impl KubernetesApplicationSpec {
  pub fn traffic_routing_method(&self) -> TrafficRoutingMethod {
    self
      .traffic_routing
      .as_ref()
      .map(|t| t.method)
      .unwrap_or(TrafficRoutingMethod::PodSelector)
  }

  /// Options of the primary rollout stage, when the pipeline has one.
  pub fn primary_rollout_options(&self) -> Result<Option<K8sPrimaryRolloutStageOptions>, ConfigError> {
    let Some(pipeline) = &self.generic.pipeline else {
      return Ok(None);
    };
    pipeline
      .stages
      .iter()
      .find(|s| s.name == StageName::K8sPrimaryRollout)
      .map(|s| s.options())
      .transpose()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesVariantLabel {
  pub key: String,
  pub primary_value: String,
  pub canary_value: String,
  pub baseline_value: String,
}

impl Default for KubernetesVariantLabel {
  fn default() -> Self {
    Self {
      key: DEFAULT_VARIANT_LABEL.to_string(),
      primary_value: DEFAULT_PRIMARY_VARIANT.to_string(),
      canary_value: DEFAULT_CANARY_VARIANT.to_string(),
      baseline_value: DEFAULT_BASELINE_VARIANT.to_string(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesDeploymentInput {
  /// Manifest files to load. Empty loads every manifest in the directory.
  pub manifests: Vec<String>,
  pub kubectl_version: String,
  pub kustomize_version: String,
  pub kustomize_options: BTreeMap<String, String>,
  pub helm_version: String,
  pub helm_chart: Option<InputHelmChart>,
  pub helm_options: Option<InputHelmOptions>,
  /// Namespace the manifests are applied to.
  pub namespace: String,
  pub auto_rollback: bool,
  pub auto_create_namespace: bool,
}

impl Default for KubernetesDeploymentInput {
  fn default() -> Self {
    Self {
      manifests: Vec::new(),
      kubectl_version: String::new(),
      kustomize_version: String::new(),
      kustomize_options: BTreeMap::new(),
      helm_version: String::new(),
      helm_chart: None,
      helm_options: None,
      namespace: String::new(),
      auto_rollback: true,
      auto_create_namespace: false,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputHelmChart {
  /// Git remote holding the chart. Empty means the application repository.
  pub git_remote: String,
  /// Branch or tag of `git_remote` to check out.
  #[serde(rename = "ref")]
  pub git_ref: String,
  /// Chart directory relative to the repository root (or the app directory).
  pub path: String,
  /// Name of an added chart repository.
  pub repository: String,
  pub name: String,
  pub version: String,
  #[serde(skip)]
  pub insecure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputHelmOptions {
  /// Defaults to the application name.
  pub release_name: String,
  pub value_files: Vec<String>,
  pub set_files: BTreeMap<String, String>,
  pub api_versions: Vec<String>,
  pub kube_version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficRoutingMethod {
  #[default]
  #[serde(rename = "podselector")]
  PodSelector,
  Istio,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesTrafficRouting {
  pub method: TrafficRoutingMethod,
  pub istio: Option<IstioTrafficRouting>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IstioTrafficRouting {
  /// Routes of the VirtualService that may be rewritten. Empty means all.
  pub editable_routes: Vec<String>,
  pub host: String,
  /// Empty picks the first VirtualService.
  pub virtual_service: K8sResourceReference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sResourceReference {
  pub kind: String,
  pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesResourceRoute {
  pub provider: KubernetesProviderMatcher,
  #[serde(rename = "match")]
  pub matcher: Option<KubernetesResourceRouteMatcher>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesProviderMatcher {
  pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesResourceRouteMatcher {
  pub kind: String,
  pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LambdaApplicationSpec {
  #[serde(flatten)]
  pub generic: GenericApplicationSpec,
  pub input: LambdaDeploymentInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LambdaDeploymentInput {
  pub function_manifest_file: String,
  pub auto_rollback: bool,
}

impl Default for LambdaDeploymentInput {
  fn default() -> Self {
    Self {
      function_manifest_file: DEFAULT_FUNCTION_MANIFEST_FILENAME.to_string(),
      auto_rollback: true,
    }
  }
}
