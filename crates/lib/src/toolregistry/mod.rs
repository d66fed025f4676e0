//! On-demand installation of external command-line tools.
//!
//! The registry owns one binary directory. Binaries are named
//! `<tool>-<version>` for pinned versions and `<tool>` for the default
//! version. Anything already present in the directory when the registry is
//! created counts as installed.
//!
//! Concurrent [`Registry::ensure`] calls for the same `(tool, version)` share a
//! single install; failures are not remembered, so the next call retries.

mod templates;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::consts::TOOL_INSTALL_TIMEOUT;
use crate::singleflight;

pub use templates::{HELM_INSTALL_SCRIPT, KUBECTL_INSTALL_SCRIPT, KUSTOMIZE_INSTALL_SCRIPT, render};

pub const KUBECTL: &str = "kubectl";
pub const KUSTOMIZE: &str = "kustomize";
pub const HELM: &str = "helm";

pub const DEFAULT_KUBECTL_VERSION: &str = "1.18.2";
pub const DEFAULT_KUSTOMIZE_VERSION: &str = "3.8.1";
pub const DEFAULT_HELM_VERSION: &str = "3.8.2";

/// Errors from provisioning a tool.
///
/// Messages are kept as strings so one failure can be handed to every caller
/// waiting on the same install.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolRegistryError {
  #[error("unknown tool: {0}")]
  UnknownTool(String),

  #[error("failed to prepare install of {tool} {version}: {message}")]
  Prepare {
    tool: String,
    version: String,
    message: String,
  },

  #[error("failed to install {tool} {version} because of timeout")]
  Timeout { tool: String, version: String },

  #[error("failed to install {tool} {version} (exit code {code:?}): {output}")]
  InstallFailed {
    tool: String,
    version: String,
    code: Option<i32>,
    output: String,
  },

  #[error("failed to load installed tools from {path}: {message}")]
  Load { path: PathBuf, message: String },
}

/// What a recipe needs to install one tool version.
#[derive(Debug, Clone)]
pub struct InstallRequest {
  pub tool: String,
  /// Concrete version; never empty.
  pub version: String,
  pub bin_dir: PathBuf,
  /// Also write the bare `<tool>` alias.
  pub as_default: bool,
}

/// A way to install a tool into the binary directory.
#[async_trait]
pub trait InstallRecipe: Send + Sync {
  /// The version installed when callers ask for the default.
  fn default_version(&self) -> &str;

  async fn install(&self, request: &InstallRequest) -> Result<(), ToolRegistryError>;
}

/// Recipe that renders a shell script template and runs it with `/bin/sh`.
pub struct ScriptRecipe {
  default_version: String,
  template: String,
  timeout: Duration,
}

impl ScriptRecipe {
  pub fn new(default_version: impl Into<String>, template: impl Into<String>) -> Self {
    Self {
      default_version: default_version.into(),
      template: template.into(),
      timeout: TOOL_INSTALL_TIMEOUT,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

#[async_trait]
impl InstallRecipe for ScriptRecipe {
  fn default_version(&self) -> &str {
    &self.default_version
  }

  async fn install(&self, request: &InstallRequest) -> Result<(), ToolRegistryError> {
    let prepare_err = |message: String| ToolRegistryError::Prepare {
      tool: request.tool.clone(),
      version: request.version.clone(),
      message,
    };

    let work_dir = tempfile::Builder::new()
      .prefix(&format!("{}-install", request.tool))
      .tempdir()
      .map_err(|e| prepare_err(e.to_string()))?;

    let script = render(
      &self.template,
      &work_dir.path().to_string_lossy(),
      &request.version,
      &request.bin_dir.to_string_lossy(),
      request.as_default,
    );

    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(&script).kill_on_drop(true);

    let output = match tokio::time::timeout(self.timeout, command.output()).await {
      Ok(result) => result.map_err(|e| prepare_err(e.to_string()))?,
      Err(_) => {
        error!(tool = %request.tool, version = %request.version, "tool install timed out");
        return Err(ToolRegistryError::Timeout {
          tool: request.tool.clone(),
          version: request.version.clone(),
        });
      }
    };

    if !output.status.success() {
      let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
      combined.push_str(&String::from_utf8_lossy(&output.stderr));
      error!(
        tool = %request.tool,
        version = %request.version,
        script = %script,
        out = %combined,
        "failed to install tool"
      );
      return Err(ToolRegistryError::InstallFailed {
        tool: request.tool.clone(),
        version: request.version.clone(),
        code: output.status.code(),
        output: combined,
      });
    }

    Ok(())
  }
}

/// Result of [`Registry::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
  pub path: PathBuf,
  /// Whether this call triggered (or joined) an install.
  pub installed: bool,
}

pub struct Registry {
  bin_dir: PathBuf,
  known: RwLock<HashSet<String>>,
  recipes: HashMap<String, Arc<dyn InstallRecipe>>,
  installs: singleflight::Group<(), ToolRegistryError>,
}

impl Registry {
  /// Create a registry with the built-in kubectl, kustomize and helm recipes.
  pub fn new(bin_dir: impl Into<PathBuf>) -> Result<Self, ToolRegistryError> {
    let mut registry = Self::empty(bin_dir)?;
    registry.register(KUBECTL, ScriptRecipe::new(DEFAULT_KUBECTL_VERSION, KUBECTL_INSTALL_SCRIPT));
    registry.register(KUSTOMIZE, ScriptRecipe::new(DEFAULT_KUSTOMIZE_VERSION, KUSTOMIZE_INSTALL_SCRIPT));
    registry.register(HELM, ScriptRecipe::new(DEFAULT_HELM_VERSION, HELM_INSTALL_SCRIPT));
    Ok(registry)
  }

  /// Create a registry with no recipes.
  pub fn empty(bin_dir: impl Into<PathBuf>) -> Result<Self, ToolRegistryError> {
    let bin_dir = bin_dir.into();
    std::fs::create_dir_all(&bin_dir).map_err(|e| ToolRegistryError::Load {
      path: bin_dir.clone(),
      message: e.to_string(),
    })?;

    let known = load_installed(&bin_dir)?;
    info!(tools = ?known, "loaded pre-installed tools");

    Ok(Self {
      bin_dir,
      known: RwLock::new(known),
      recipes: HashMap::new(),
      installs: singleflight::Group::new(),
    })
  }

  /// Add or replace the recipe for `tool`.
  pub fn register(&mut self, tool: &str, recipe: impl InstallRecipe + 'static) {
    self.recipes.insert(tool.to_string(), Arc::new(recipe));
  }

  pub fn bin_dir(&self) -> &Path {
    &self.bin_dir
  }

  /// Return the path of `tool` at `version`, installing it when missing.
  ///
  /// An empty `version` selects the recipe's default and the bare `<tool>`
  /// binary name.
  pub async fn ensure(&self, tool: &str, version: &str) -> Result<Ensured, ToolRegistryError> {
    let name = binary_name(tool, version);
    let path = self.bin_dir.join(&name);

    if self.known.read().contains(&name) {
      return Ok(Ensured { path, installed: false });
    }

    let recipe = self
      .recipes
      .get(tool)
      .cloned()
      .ok_or_else(|| ToolRegistryError::UnknownTool(tool.to_string()))?;

    let as_default = version.is_empty();
    let request = InstallRequest {
      tool: tool.to_string(),
      version: if as_default {
        recipe.default_version().to_string()
      } else {
        version.to_string()
      },
      bin_dir: self.bin_dir.clone(),
      as_default,
    };

    let (result, shared) = self
      .installs
      .work(&name, move || async move { recipe.install(&request).await })
      .await;
    result?;

    if !shared {
      info!(tool = %tool, version = %version, "just installed tool");
    }
    self.known.write().insert(name);

    Ok(Ensured { path, installed: true })
  }

  pub async fn kubectl(&self, version: &str) -> Result<Ensured, ToolRegistryError> {
    self.ensure(KUBECTL, version).await
  }

  pub async fn kustomize(&self, version: &str) -> Result<Ensured, ToolRegistryError> {
    self.ensure(KUSTOMIZE, version).await
  }

  pub async fn helm(&self, version: &str) -> Result<Ensured, ToolRegistryError> {
    self.ensure(HELM, version).await
  }
}

fn binary_name(tool: &str, version: &str) -> String {
  if version.is_empty() {
    tool.to_string()
  } else {
    format!("{}-{}", tool, version)
  }
}

fn load_installed(bin_dir: &Path) -> Result<HashSet<String>, ToolRegistryError> {
  let mut tools = HashSet::new();
  for entry in WalkDir::new(bin_dir).min_depth(1).max_depth(1) {
    let entry = entry.map_err(|e| ToolRegistryError::Load {
      path: bin_dir.to_path_buf(),
      message: e.to_string(),
    })?;
    if entry.file_type().is_file() {
      tools.insert(entry.file_name().to_string_lossy().into_owned());
    }
  }
  Ok(tools)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tempfile::TempDir;

  struct CountingRecipe {
    installs: Arc<AtomicUsize>,
    fail: bool,
  }

  #[async_trait]
  impl InstallRecipe for CountingRecipe {
    fn default_version(&self) -> &str {
      "9.9.9"
    }

    async fn install(&self, request: &InstallRequest) -> Result<(), ToolRegistryError> {
      self.installs.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(50)).await;
      if self.fail {
        return Err(ToolRegistryError::InstallFailed {
          tool: request.tool.clone(),
          version: request.version.clone(),
          code: Some(1),
          output: "boom".to_string(),
        });
      }
      let name = binary_name(&request.tool, &request.version);
      std::fs::write(request.bin_dir.join(name), "#!/bin/sh\n").unwrap();
      Ok(())
    }
  }

  fn counting_registry(dir: &Path, fail: bool) -> (Registry, Arc<AtomicUsize>) {
    let installs = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::empty(dir).unwrap();
    registry.register(
      KUBECTL,
      CountingRecipe {
        installs: installs.clone(),
        fail,
      },
    );
    (registry, installs)
  }

  #[tokio::test]
  async fn fifty_concurrent_ensures_install_once() {
    let temp = TempDir::new().unwrap();
    let (registry, installs) = counting_registry(temp.path(), false);
    let registry = Arc::new(registry);

    let mut handles = Vec::new();
    for _ in 0..50 {
      let registry = registry.clone();
      handles.push(tokio::spawn(async move { registry.ensure(KUBECTL, "1.29.0").await }));
    }

    let expected = temp.path().join("kubectl-1.29.0");
    for handle in handles {
      let ensured = handle.await.unwrap().unwrap();
      assert_eq!(ensured.path, expected);
    }
    assert_eq!(installs.load(Ordering::SeqCst), 1);

    let again = registry.ensure(KUBECTL, "1.29.0").await.unwrap();
    assert!(!again.installed);
    assert_eq!(installs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn failed_install_is_retried() {
    let temp = TempDir::new().unwrap();
    let (registry, installs) = counting_registry(temp.path(), true);

    assert!(registry.ensure(KUBECTL, "1.0.0").await.is_err());
    assert!(registry.ensure(KUBECTL, "1.0.0").await.is_err());
    assert_eq!(installs.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn empty_version_uses_default_alias() {
    let temp = TempDir::new().unwrap();
    let (registry, _) = counting_registry(temp.path(), false);

    let ensured = registry.kubectl("").await.unwrap();
    assert_eq!(ensured.path, temp.path().join("kubectl"));
    assert!(ensured.installed);
  }

  #[tokio::test]
  async fn preinstalled_binaries_are_recovered() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("helm-3.8.2"), "bin").unwrap();
    std::fs::create_dir(temp.path().join("nested")).unwrap();

    let registry = Registry::new(temp.path()).unwrap();
    let ensured = registry.helm("3.8.2").await.unwrap();
    assert!(!ensured.installed);
    assert_eq!(ensured.path, temp.path().join("helm-3.8.2"));
  }

  #[tokio::test]
  async fn unknown_tool_is_rejected() {
    let temp = TempDir::new().unwrap();
    let registry = Registry::empty(temp.path()).unwrap();
    let err = registry.ensure("terraform", "").await.unwrap_err();
    assert_eq!(err, ToolRegistryError::UnknownTool("terraform".to_string()));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn script_recipe_surfaces_exit_code() {
    let temp = TempDir::new().unwrap();
    let mut registry = Registry::empty(temp.path()).unwrap();
    registry.register("fake", ScriptRecipe::new("1.0.0", "echo failing {version}; exit 3"));

    let err = registry.ensure("fake", "").await.unwrap_err();
    match err {
      ToolRegistryError::InstallFailed { code, output, version, .. } => {
        assert_eq!(code, Some(3));
        assert_eq!(version, "1.0.0");
        assert!(output.contains("failing 1.0.0"));
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn script_recipe_installs_into_bin_dir() {
    let temp = TempDir::new().unwrap();
    let mut registry = Registry::empty(temp.path()).unwrap();
    registry.register(
      "fake",
      ScriptRecipe::new(
        "2.0.0",
        "cd {work_dir} && echo hi > fake && mv fake {bin_dir}/fake-{version} && \
         if [ \"{as_default}\" = \"true\" ]; then cp {bin_dir}/fake-{version} {bin_dir}/fake; fi",
      ),
    );

    let ensured = registry.ensure("fake", "").await.unwrap();
    assert!(ensured.path.is_file());
    assert!(temp.path().join("fake-2.0.0").is_file());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn script_recipe_times_out() {
    let temp = TempDir::new().unwrap();
    let mut registry = Registry::empty(temp.path()).unwrap();
    registry.register(
      "slow",
      ScriptRecipe::new("1.0.0", "sleep 5").with_timeout(Duration::from_millis(100)),
    );

    let err = registry.ensure("slow", "1.0.0").await.unwrap_err();
    assert!(matches!(err, ToolRegistryError::Timeout { .. }));
  }
}
