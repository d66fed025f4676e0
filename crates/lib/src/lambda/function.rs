//! The `LambdaFunction` manifest kept in git next to the application config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const VERSION_V1BETA1: &str = "pipecd.dev/v1beta1";
pub const FUNCTION_MANIFEST_KIND: &str = "LambdaFunction";

const MEMORY_LOWER_LIMIT: i32 = 1;
const TIMEOUT_LOWER_LIMIT: i32 = 1;
const TIMEOUT_UPPER_LIMIT: i32 = 900;
const EPHEMERAL_STORAGE_LOWER_LIMIT: i32 = 512;
const EPHEMERAL_STORAGE_UPPER_LIMIT: i32 = 10240;

#[derive(Debug, Error)]
pub enum FunctionManifestError {
  #[error("failed to read function manifest {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse function manifest: {0}")]
  Parse(#[from] serde_yaml::Error),

  #[error("{0}")]
  Invalid(String),
}

fn invalid(message: impl Into<String>) -> FunctionManifestError {
  FunctionManifestError::Invalid(message.into())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionManifest {
  #[serde(default)]
  pub kind: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub api_version: String,
  #[serde(default)]
  pub spec: FunctionManifestSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionManifestSpec {
  pub name: String,
  pub role: String,
  /// Container image URI.
  pub image: String,
  pub s3_bucket: String,
  pub s3_key: String,
  pub s3_object_version: String,
  pub source: SourceCode,
  pub handler: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub architectures: Vec<Architecture>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ephemeral_storage: Option<EphemeralStorage>,
  pub runtime: String,
  pub memory: i32,
  pub timeout: i32,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub tags: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub environments: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub vpc_config: Option<VpcConfig>,
  /// Layer ARNs including the version. Ignored for container images.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub layers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceCode {
  pub git: String,
  #[serde(rename = "ref")]
  pub git_ref: String,
  pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Architecture {
  pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralStorage {
  pub size: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VpcConfig {
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub security_group_ids: Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub subnet_ids: Vec<String>,
}

impl FunctionManifest {
  pub fn validate(&self) -> Result<(), FunctionManifestError> {
    if self.api_version != VERSION_V1BETA1 {
      return Err(invalid(format!("unsupported version: {}", self.api_version)));
    }
    if self.kind != FUNCTION_MANIFEST_KIND {
      return Err(invalid(format!("invalid manifest kind given: {}", self.kind)));
    }
    self.spec.validate()
  }

  /// The manifest as a JSON tree, used for drift comparison.
  pub fn to_value(&self) -> serde_json::Value {
    serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
  }
}

impl FunctionManifestSpec {
  fn validate(&self) -> Result<(), FunctionManifestError> {
    if self.name.is_empty() {
      return Err(invalid("lambda function is missing"));
    }
    if self.image.is_empty() && self.s3_bucket.is_empty() {
      if self.source.git.is_empty() {
        return Err(invalid("remote git source is missing"));
      }
      if self.source.git_ref.is_empty() {
        return Err(invalid("source ref is missing"));
      }
    }
    if self.image.is_empty() {
      if self.handler.is_empty() {
        return Err(invalid("handler is missing"));
      }
      if self.runtime.is_empty() {
        return Err(invalid("runtime is missing"));
      }
    }
    for arch in &self.architectures {
      if arch.name != "x86_64" && arch.name != "arm64" {
        return Err(invalid(format!("architecture is invalid: {}", arch.name)));
      }
    }
    if let Some(storage) = &self.ephemeral_storage {
      if !(EPHEMERAL_STORAGE_LOWER_LIMIT..=EPHEMERAL_STORAGE_UPPER_LIMIT).contains(&storage.size) {
        return Err(invalid("ephemeral storage is invalid: ephemeral storage is out of range"));
      }
    }
    if self.role.is_empty() {
      return Err(invalid("role is missing"));
    }
    if self.memory < MEMORY_LOWER_LIMIT {
      return Err(invalid("memory is missing"));
    }
    if !(TIMEOUT_LOWER_LIMIT..=TIMEOUT_UPPER_LIMIT).contains(&self.timeout) {
      return Err(invalid("timeout is missing or out of range"));
    }
    Ok(())
  }
}

/// Parse and validate a function manifest.
pub fn parse_function_manifest(data: &str) -> Result<FunctionManifest, FunctionManifestError> {
  let manifest: FunctionManifest = serde_yaml::from_str(data)?;
  manifest.validate()?;
  Ok(manifest)
}

/// Load `filename` (default `function.yaml`) from `app_dir`.
pub fn load_function_manifest(app_dir: &Path, filename: &str) -> Result<FunctionManifest, FunctionManifestError> {
  let filename = if filename.is_empty() {
    crate::consts::DEFAULT_FUNCTION_MANIFEST_FILENAME
  } else {
    filename
  };
  let path = app_dir.join(filename);
  let data = std::fs::read_to_string(&path).map_err(|source| FunctionManifestError::Read { path, source })?;
  parse_function_manifest(&data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
  ContainerImage,
  S3Object,
  GitSource,
}

/// A deployable artifact and its version, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVersion {
  pub kind: ArtifactKind,
  pub version: String,
  pub name: String,
  pub url: String,
}

/// Split `registry/path/name:tag` into `(name, tag)`.
pub fn parse_container_image(image: &str) -> (String, String) {
  let parts: Vec<&str> = image.split(':').collect();
  let tag = if parts.len() == 2 { parts[1] } else { "" };
  let name = parts[0].rsplit('/').next().unwrap_or_default();
  (name.to_string(), tag.to_string())
}

/// Versions of the artifacts the function is built from.
///
/// The image tag wins over the S3 object version, which wins over the
/// source ref.
pub fn find_artifact_versions(manifest: &FunctionManifest) -> Result<Vec<ArtifactVersion>, FunctionManifestError> {
  let spec = &manifest.spec;
  if !spec.image.is_empty() {
    let (name, tag) = parse_container_image(&spec.image);
    if name.is_empty() {
      return Err(invalid("image name could not be empty"));
    }
    return Ok(vec![ArtifactVersion {
      kind: ArtifactKind::ContainerImage,
      version: tag,
      name,
      url: spec.image.clone(),
    }]);
  }

  if !spec.s3_object_version.is_empty() {
    return Ok(vec![ArtifactVersion {
      kind: ArtifactKind::S3Object,
      version: spec.s3_object_version.clone(),
      name: spec.s3_key.clone(),
      url: format!(
        "https://console.aws.amazon.com/s3/object/{}?prefix={}",
        spec.s3_bucket, spec.s3_key
      ),
    }]);
  }

  if !spec.source.git_ref.is_empty() {
    let (name, url) = commit_link(&spec.source.git, &spec.source.git_ref)?;
    return Ok(vec![ArtifactVersion {
      kind: ArtifactKind::GitSource,
      version: spec.source.git_ref.clone(),
      name,
      url,
    }]);
  }

  Err(invalid("couldn't determine artifact versions"))
}

/// Revision name `<function>-<tag without dots>-<short commit>`.
pub fn decide_revision_name(manifest: &FunctionManifest, commit: &str) -> Result<String, FunctionManifestError> {
  let (name, tag) = parse_container_image(&manifest.spec.image);
  if name.is_empty() {
    return Err(invalid("image name could not be empty"));
  }
  let short: String = commit.chars().take(7).collect();
  Ok(format!("{}-{}-{}", manifest.spec.name, tag.replace('.', ""), short))
}

/// Repository path and web link to `git_ref` for known hosts.
fn commit_link(remote: &str, git_ref: &str) -> Result<(String, String), FunctionManifestError> {
  let (scheme, host, path) = split_git_url(remote).ok_or_else(|| invalid(format!("invalid git url: {}", remote)))?;
  let scheme = if scheme == "ssh" { "https" } else { scheme };
  let repo_path = path.trim_matches('/').trim_end_matches(".git");

  let url = match host {
    "github.com" | "gitlab.com" => format!("{}://{}/{}/commit/{}", scheme, host, repo_path, git_ref),
    "bitbucket.org" => format!("{}://{}/{}/commits/{}", scheme, host, repo_path, git_ref),
    _ => return Ok((String::new(), String::new())),
  };
  Ok((repo_path.to_string(), url))
}

/// `(scheme, host, path)` of a URL or scp-like `user@host:path` remote.
fn split_git_url(remote: &str) -> Option<(&str, &str, &str)> {
  if let Some((scheme, rest)) = remote.split_once("://") {
    let rest = rest.rsplit_once('@').map_or(rest, |(_, r)| r);
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = host.split(':').next().unwrap_or(host);
    return Some((scheme, host, path));
  }
  let rest = remote.split_once('@').map_or(remote, |(_, r)| r);
  let (host, path) = rest.split_once(':')?;
  Some(("ssh", host, path))
}
