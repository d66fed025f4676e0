//! Agent and application configuration.
//!
//! The agent reads one YAML document describing itself (`PipedSpec`). Each
//! application keeps its own YAML document next to its manifests
//! (`app.pipecd.yaml`), parsed by [`load_application_config`].

mod application;
mod stage;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use application::*;
pub use stage::*;

use crate::consts::DEFAULT_DRIFT_DETECTION_INTERVAL;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("invalid stage options for {stage}: {source}")]
  StageOptions {
    stage: String,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("invalid {kind} spec: {source}")]
  Spec {
    kind: String,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("unexpected application kind {actual}, expected {expected}")]
  UnexpectedKind { expected: String, actual: String },

  #[error("invalid config: {0}")]
  Invalid(String),
}

/// Parse a YAML file into `T`.
pub fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
  let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
    path: path.to_path_buf(),
    source,
  })
}

/// Configuration of the agent process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipedSpec {
  /// The id of this agent instance.
  pub piped_id: String,
  /// Root directory for clones and temporary files.
  pub work_dir: PathBuf,
  /// Where external tools are installed.
  pub tools_dir: PathBuf,
  pub repositories: Vec<PipedRepository>,
  pub chart_repositories: Vec<HelmChartRepository>,
  pub platform_providers: Vec<PlatformProvider>,
  pub applications: Vec<ApplicationRef>,
  #[serde(with = "duration_secs")]
  pub drift_detection_interval: Duration,
}

impl PipedSpec {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let mut spec: PipedSpec = load_yaml(path)?;
    if spec.drift_detection_interval.is_zero() {
      spec.drift_detection_interval = DEFAULT_DRIFT_DETECTION_INTERVAL;
    }
    spec.validate()?;
    Ok(spec)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.piped_id.is_empty() {
      return Err(ConfigError::Invalid("pipedId is required".to_string()));
    }
    for app in &self.applications {
      if self.find_repository(&app.repo_id).is_none() {
        return Err(ConfigError::Invalid(format!(
          "application {} refers to unknown repository {}",
          app.id, app.repo_id
        )));
      }
    }
    Ok(())
  }

  pub fn find_repository(&self, id: &str) -> Option<&PipedRepository> {
    self.repositories.iter().find(|r| r.repo_id == id)
  }

  pub fn find_platform_provider(&self, name: &str) -> Option<&PlatformProvider> {
    self.platform_providers.iter().find(|p| p.name == name)
  }

  /// Chart repositories reachable over HTTP, the ones `helm repo add` handles.
  pub fn http_chart_repositories(&self) -> Vec<HelmChartRepository> {
    self
      .chart_repositories
      .iter()
      .filter(|r| r.kind == HelmChartRepositoryType::Http)
      .cloned()
      .collect()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipedRepository {
  pub repo_id: String,
  pub remote: String,
  pub branch: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HelmChartRepositoryType {
  #[default]
  Http,
  Git,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmChartRepository {
  #[serde(rename = "type")]
  pub kind: HelmChartRepositoryType,
  pub name: String,
  pub address: String,
  pub username: String,
  pub password: String,
  pub insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformProvider {
  pub name: String,
  #[serde(flatten)]
  pub config: PlatformProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "UPPERCASE")]
pub enum PlatformProviderConfig {
  Kubernetes(KubernetesProviderConfig),
  Lambda(LambdaProviderConfig),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesProviderConfig {
  pub master_url: String,
  pub kubeconfig_path: String,
  pub kubectl_version: String,
  pub app_state_informer: AppStateInformer,
}

/// Which cluster resources the live-state store watches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppStateInformer {
  /// Only watch this namespace. Empty means all namespaces.
  pub namespace: String,
  pub include_resources: Vec<ResourceMatcher>,
  pub exclude_resources: Vec<ResourceMatcher>,
}

/// Matches resources by api version and, optionally, kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceMatcher {
  pub api_version: String,
  pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LambdaProviderConfig {
  pub region: String,
  pub profile: String,
  pub credentials_file: String,
  pub role_arn: String,
  pub token_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApplicationKind {
  Kubernetes,
  Lambda,
}

/// An application this agent is responsible for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRef {
  pub id: String,
  pub name: String,
  pub kind: ApplicationKind,
  pub platform_provider: String,
  pub repo_id: String,
  /// Application directory relative to the repository root.
  pub path: String,
  #[serde(default)]
  pub config_filename: String,
}

impl ApplicationRef {
  pub fn config_filename(&self) -> &str {
    if self.config_filename.is_empty() {
      crate::consts::DEFAULT_APP_CONFIG_FILENAME
    } else {
      &self.config_filename
    }
  }
}

/// Durations written as humanized strings (`30s`, `1m`) or plain seconds.
pub(crate) mod duration_secs {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{}s", d.as_secs()))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
      Secs(u64),
      Text(String),
    }

    match Raw::deserialize(d)? {
      Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
      Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
    }
  }
}

/// Parse `90`, `90s`, `15m`, `6h` or combinations such as `1m30s`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
  let text = text.trim();
  if text.is_empty() {
    return Ok(Duration::ZERO);
  }
  if let Ok(secs) = text.parse::<u64>() {
    return Ok(Duration::from_secs(secs));
  }

  let mut total = 0u64;
  let mut number = String::new();
  for ch in text.chars() {
    if ch.is_ascii_digit() {
      number.push(ch);
      continue;
    }
    let value: u64 = number.parse().map_err(|_| format!("invalid duration: {}", text))?;
    number.clear();
    total += match ch {
      's' => value,
      'm' => value * 60,
      'h' => value * 3600,
      _ => return Err(format!("invalid duration unit {:?} in {}", ch, text)),
    };
  }
  if !number.is_empty() {
    return Err(format!("missing unit in duration: {}", text));
  }
  Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const PIPED_YAML: &str = r#"
pipedId: piped-1
toolsDir: /tmp/tools
driftDetectionInterval: 2m
repositories:
  - repoId: main
    remote: https://example.com/org/repo.git
    branch: master
chartRepositories:
  - name: bitnami
    address: https://charts.bitnami.com/bitnami
  - type: GIT
    name: internal
    address: git@example.com:org/charts.git
platformProviders:
  - name: cluster
    type: KUBERNETES
    config:
      kubeconfigPath: /etc/kube/config
      appStateInformer:
        namespace: apps
  - name: aws
    type: LAMBDA
    config:
      region: us-west-2
applications:
  - id: app-1
    name: canary
    kind: KUBERNETES
    platformProvider: cluster
    repoId: main
    path: kubernetes/canary
"#;

  #[test]
  fn loads_piped_spec() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("piped.yaml");
    std::fs::write(&path, PIPED_YAML).unwrap();

    let spec = PipedSpec::load(&path).unwrap();
    assert_eq!(spec.piped_id, "piped-1");
    assert_eq!(spec.drift_detection_interval, Duration::from_secs(120));
    assert_eq!(spec.http_chart_repositories().len(), 1);
    assert_eq!(spec.applications[0].config_filename(), "app.pipecd.yaml");

    match &spec.find_platform_provider("cluster").unwrap().config {
      PlatformProviderConfig::Kubernetes(cfg) => {
        assert_eq!(cfg.kubeconfig_path, "/etc/kube/config");
        assert_eq!(cfg.app_state_informer.namespace, "apps");
      }
      other => panic!("unexpected provider config: {other:?}"),
    }
  }

  #[test]
  fn defaults_drift_interval() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("piped.yaml");
    std::fs::write(&path, "pipedId: p\n").unwrap();

    let spec = PipedSpec::load(&path).unwrap();
    assert_eq!(spec.drift_detection_interval, DEFAULT_DRIFT_DETECTION_INTERVAL);
  }

  #[test]
  fn rejects_unknown_repository() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("piped.yaml");
    std::fs::write(
      &path,
      "pipedId: p\napplications:\n  - {id: a, name: a, kind: LAMBDA, platformProvider: aws, repoId: nope, path: a}\n",
    )
    .unwrap();

    let err = PipedSpec::load(&path).unwrap_err();
    assert!(err.to_string().contains("unknown repository nope"));
  }

  #[test]
  fn parses_durations() {
    assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(6 * 3600));
    assert!(parse_duration("5x").is_err());
    assert!(parse_duration("5m3").is_err());
  }
}
