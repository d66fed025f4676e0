//! Thin wrapper over the `kubectl` binary.
//!
//! Every call builds its arguments in the same order: `--kubeconfig`,
//! `--namespace`, the verb, then `-f -` with the manifest streamed on stdin.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::manifest::{Manifest, ManifestError, parse_manifests};
use super::resource_key::ResourceKey;
use crate::consts::{ANNOTATION_SERVER_SIDE_APPLY, SERVER_SIDE_APPLY_TRUE};
use crate::metrics::record_tool_call;
use crate::toolregistry::{KUBECTL, ToolRegistryError};
use crate::util::process::{ToolOutput, run_tool};

const NOT_FOUND_LITERAL: &str = "(NotFound)";
const ALREADY_EXISTS_LITERAL: &str = "(AlreadyExists)";

#[derive(Debug, Error)]
pub enum KubectlError {
  #[error("resource not found: {0}")]
  NotFound(String),

  #[error("failed to {verb}: {output}")]
  Command { verb: &'static str, output: String },

  #[error("failed to run kubectl: {0}")]
  Spawn(#[from] std::io::Error),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error("no kubectl {version} ({source})")]
  Tool {
    version: String,
    #[source]
    source: ToolRegistryError,
  },
}

impl KubectlError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, KubectlError::NotFound(_))
  }
}

#[derive(Debug, Clone)]
pub struct Kubectl {
  version: String,
  exec_path: PathBuf,
}

impl Kubectl {
  pub fn new(version: impl Into<String>, exec_path: impl Into<PathBuf>) -> Self {
    Self {
      version: version.into(),
      exec_path: exec_path.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn exec_path(&self) -> &Path {
    &self.exec_path
  }

  pub async fn apply(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> Result<(), KubectlError> {
    let data = manifest.to_yaml()?;
    let mut args = base_args(kubeconfig, namespace);
    args.push("apply".to_string());
    if manifest.annotation(ANNOTATION_SERVER_SIDE_APPLY) == Some(SERVER_SIDE_APPLY_TRUE) {
      args.push("--server-side".to_string());
    }
    args.extend(["-f".to_string(), "-".to_string()]);

    let out = self.call("apply", &args, Some(data.as_bytes())).await?;
    if !out.success {
      return Err(KubectlError::Command {
        verb: "apply",
        output: out.combined(),
      });
    }
    Ok(())
  }

  pub async fn create(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> Result<(), KubectlError> {
    let data = manifest.to_yaml()?;
    let mut args = base_args(kubeconfig, namespace);
    args.extend(["create".to_string(), "-f".to_string(), "-".to_string()]);

    let out = self.call("create", &args, Some(data.as_bytes())).await?;
    if !out.success {
      return Err(KubectlError::Command {
        verb: "create",
        output: out.combined(),
      });
    }
    Ok(())
  }

  /// Replace a resource. A missing resource yields [`KubectlError::NotFound`].
  pub async fn replace(&self, kubeconfig: &str, namespace: &str, manifest: &Manifest) -> Result<(), KubectlError> {
    let data = manifest.to_yaml()?;
    let mut args = base_args(kubeconfig, namespace);
    args.extend(["replace".to_string(), "-f".to_string(), "-".to_string()]);

    let out = self.call("replace", &args, Some(data.as_bytes())).await?;
    if out.success {
      return Ok(());
    }
    let combined = out.combined();
    if combined.contains(NOT_FOUND_LITERAL) {
      return Err(KubectlError::NotFound(manifest.key.to_string()));
    }
    Err(KubectlError::Command {
      verb: "replace",
      output: combined,
    })
  }

  pub async fn delete(&self, kubeconfig: &str, namespace: &str, key: &ResourceKey) -> Result<(), KubectlError> {
    let mut args = base_args(kubeconfig, namespace);
    args.extend(["delete".to_string(), key.kind.clone(), key.name.clone()]);

    let out = self.call("delete", &args, None).await?;
    let combined = out.combined();
    if combined.contains(NOT_FOUND_LITERAL) {
      return Err(KubectlError::NotFound(format!("{}: {}", key, combined.trim())));
    }
    if !out.success {
      return Err(KubectlError::Command {
        verb: "delete",
        output: combined,
      });
    }
    Ok(())
  }

  pub async fn get(&self, kubeconfig: &str, namespace: &str, key: &ResourceKey) -> Result<Manifest, KubectlError> {
    let mut args = base_args(kubeconfig, namespace);
    args.extend([
      "get".to_string(),
      key.kind.clone(),
      key.name.clone(),
      "-o".to_string(),
      "yaml".to_string(),
    ]);

    let out = self.call("get", &args, None).await?;
    if out.combined().contains(NOT_FOUND_LITERAL) {
      return Err(KubectlError::NotFound(key.to_string()));
    }
    if !out.success {
      return Err(KubectlError::Command {
        verb: "get",
        output: out.combined(),
      });
    }
    parse_manifests(&out.stdout)?
      .into_iter()
      .next()
      .ok_or_else(|| KubectlError::NotFound(key.to_string()))
  }

  /// Create `namespace`, treating an existing one as success.
  pub async fn create_namespace(&self, kubeconfig: &str, namespace: &str) -> Result<(), KubectlError> {
    let mut args = base_args(kubeconfig, "");
    args.extend(["create".to_string(), "namespace".to_string(), namespace.to_string()]);

    let out = self.call("create-namespace", &args, None).await?;
    if out.success || out.combined().contains(ALREADY_EXISTS_LITERAL) {
      return Ok(());
    }
    Err(KubectlError::Command {
      verb: "create namespace",
      output: out.combined(),
    })
  }

  async fn call(&self, verb: &str, args: &[String], stdin: Option<&[u8]>) -> Result<ToolOutput, KubectlError> {
    let result = run_tool(&self.exec_path, args, None, stdin).await;
    let success = matches!(&result, Ok(out) if out.success);
    record_tool_call(KUBECTL, &self.version, verb, success);
    Ok(result?)
  }
}

fn base_args(kubeconfig: &str, namespace: &str) -> Vec<String> {
  let mut args = Vec::with_capacity(8);
  if !kubeconfig.is_empty() {
    args.extend(["--kubeconfig".to_string(), kubeconfig.to_string()]);
  }
  if !namespace.is_empty() {
    args.extend(["--namespace".to_string(), namespace.to_string()]);
  }
  args
}
