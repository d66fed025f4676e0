//! Rendering an application directory into manifests.
//!
//! The templating method is chosen once per loader: a configured helm chart
//! wins, then a `kustomization.yaml` in the application directory, then plain
//! YAML files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;
use walkdir::WalkDir;

use super::helm::{Helm, RemoteChart, RemoteGitChart, TemplateError};
use super::kustomize::Kustomize;
use super::manifest::{Manifest, ManifestError, load_manifests_from_file, parse_manifests};
use super::resource_key::ApiVersionKind;
use crate::chartrepo::ChartRepos;
use crate::config::KubernetesDeploymentInput;
use crate::consts::{ANNOTATION_ORDER, KUSTOMIZATION_FILENAME};
use crate::git::GitClient;
use crate::toolregistry::{HELM, KUSTOMIZE, Registry, ToolRegistryError};

#[derive(Debug, Error)]
pub enum LoaderError {
  #[error("no {tool} {version} ({source})")]
  Tool {
    tool: &'static str,
    version: String,
    #[source]
    source: ToolRegistryError,
  },

  #[error("unable to run {method} template: {source}")]
  Template {
    method: TemplatingMethod,
    #[source]
    source: TemplateError,
  },

  #[error("chart is stored in another git repository but no git client is configured")]
  NoGitClient,

  #[error("failed to list manifest files in {path}: {source}")]
  ReadDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Manifest(#[from] ManifestError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplatingMethod {
  Helm,
  Kustomize,
  None,
}

impl std::fmt::Display for TemplatingMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      TemplatingMethod::Helm => "helm",
      TemplatingMethod::Kustomize => "kustomize",
      TemplatingMethod::None => "none",
    })
  }
}

pub fn determine_templating_method(input: &KubernetesDeploymentInput, app_dir: &Path) -> TemplatingMethod {
  if input.helm_chart.is_some() {
    return TemplatingMethod::Helm;
  }
  if app_dir.join(KUSTOMIZATION_FILENAME).exists() {
    return TemplatingMethod::Kustomize;
  }
  TemplatingMethod::None
}

/// Which kinds live inside a namespace.
///
/// Kinds not listed are treated as namespaced.
#[derive(Debug, Clone, Default)]
pub struct NamespaceScopes(HashMap<ApiVersionKind, bool>);

impl NamespaceScopes {
  /// The cluster-scoped kinds that ship with Kubernetes.
  pub fn builtin() -> Self {
    let cluster_scoped = [
      ("v1", "Namespace"),
      ("v1", "Node"),
      ("v1", "PersistentVolume"),
      ("rbac.authorization.k8s.io/v1", "ClusterRole"),
      ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
      ("rbac.authorization.k8s.io/v1beta1", "ClusterRole"),
      ("rbac.authorization.k8s.io/v1beta1", "ClusterRoleBinding"),
      ("apiextensions.k8s.io/v1", "CustomResourceDefinition"),
      ("apiextensions.k8s.io/v1beta1", "CustomResourceDefinition"),
      ("storage.k8s.io/v1", "StorageClass"),
      ("storage.k8s.io/v1beta1", "StorageClass"),
      ("scheduling.k8s.io/v1", "PriorityClass"),
      ("admissionregistration.k8s.io/v1", "MutatingWebhookConfiguration"),
      ("admissionregistration.k8s.io/v1", "ValidatingWebhookConfiguration"),
      ("apiregistration.k8s.io/v1", "APIService"),
    ];
    let mut scopes = Self::default();
    for (api_version, kind) in cluster_scoped {
      scopes.insert(ApiVersionKind::new(api_version, kind), false);
    }
    scopes
  }

  pub fn insert(&mut self, kind: ApiVersionKind, namespaced: bool) {
    self.0.insert(kind, namespaced);
  }

  pub fn is_namespaced(&self, api_version: &str, kind: &str) -> bool {
    self
      .0
      .get(&ApiVersionKind::new(api_version, kind))
      .copied()
      .unwrap_or(true)
  }
}

/// Where an application's manifests come from.
#[derive(Debug, Clone, Default)]
pub struct LoaderInput {
  pub app_name: String,
  pub app_dir: PathBuf,
  /// Root of the repository checkout containing `app_dir`.
  pub repo_dir: PathBuf,
  /// Application config file, never loaded as a manifest.
  pub config_filename: String,
  pub input: KubernetesDeploymentInput,
}

enum Templater {
  Helm(Helm),
  Kustomize(Kustomize),
  None,
}

pub struct Loader {
  input: LoaderInput,
  registry: Arc<Registry>,
  git: Option<Arc<dyn GitClient>>,
  chart_repos: Option<Arc<ChartRepos>>,
  scopes: Arc<NamespaceScopes>,
  templater: OnceCell<Templater>,
}

impl Loader {
  pub fn new(input: LoaderInput, registry: Arc<Registry>) -> Self {
    Self {
      input,
      registry,
      git: None,
      chart_repos: None,
      scopes: Arc::new(NamespaceScopes::builtin()),
      templater: OnceCell::new(),
    }
  }

  pub fn with_git(mut self, git: Arc<dyn GitClient>) -> Self {
    self.git = Some(git);
    self
  }

  pub fn with_chart_repos(mut self, chart_repos: Arc<ChartRepos>) -> Self {
    self.chart_repos = Some(chart_repos);
    self
  }

  pub fn with_namespace_scopes(mut self, scopes: Arc<NamespaceScopes>) -> Self {
    self.scopes = scopes;
    self
  }

  pub fn templating_method(&self) -> TemplatingMethod {
    determine_templating_method(&self.input.input, &self.input.app_dir)
  }

  /// Render and parse every manifest of the application, sorted by the
  /// `pipecd.dev/order` annotation with namespaces resolved.
  pub async fn load_manifests(&self) -> Result<Vec<Manifest>, LoaderError> {
    let templater = self.templater.get_or_try_init(|| self.init_templater()).await?;
    let input = &self.input.input;
    let app_dir = &self.input.app_dir;

    let mut manifests = match templater {
      Templater::Helm(helm) => {
        let data = self.template_helm(helm).await.map_err(|source| LoaderError::Template {
          method: TemplatingMethod::Helm,
          source,
        })?;
        parse_manifests(&data)?
      }
      Templater::Kustomize(kustomize) => {
        let data = kustomize
          .template(&self.input.app_name, app_dir, &input.kustomize_options)
          .await
          .map_err(|source| LoaderError::Template {
            method: TemplatingMethod::Kustomize,
            source,
          })?;
        parse_manifests(&data)?
      }
      Templater::None => load_plain_yaml_manifests(app_dir, &input.manifests, &self.input.config_filename)?,
    };

    resolve_namespaces(&mut manifests, &input.namespace, &self.scopes);
    sort_manifests(&mut manifests);
    Ok(manifests)
  }

  async fn init_templater(&self) -> Result<Templater, LoaderError> {
    let input = &self.input.input;
    match self.templating_method() {
      TemplatingMethod::Helm => {
        let ensured = self
          .registry
          .helm(&input.helm_version)
          .await
          .map_err(|source| LoaderError::Tool {
            tool: HELM,
            version: input.helm_version.clone(),
            source,
          })?;
        if ensured.installed {
          info!(version = %input.helm_version, "helm has just been installed because of no pre-installed binary for that version");
        }
        Ok(Templater::Helm(Helm::new(&input.helm_version, ensured.path)))
      }
      TemplatingMethod::Kustomize => {
        let ensured = self
          .registry
          .kustomize(&input.kustomize_version)
          .await
          .map_err(|source| LoaderError::Tool {
            tool: KUSTOMIZE,
            version: input.kustomize_version.clone(),
            source,
          })?;
        if ensured.installed {
          info!(version = %input.kustomize_version, "kustomize has just been installed because of no pre-installed binary for that version");
        }
        Ok(Templater::Kustomize(Kustomize::new(&input.kustomize_version, ensured.path)))
      }
      TemplatingMethod::None => Ok(Templater::None),
    }
  }

  async fn template_helm(&self, helm: &Helm) -> Result<String, TemplateError> {
    let input = &self.input.input;
    let Some(chart) = input.helm_chart.as_ref() else {
      return Ok(String::new());
    };
    let opts = input.helm_options.as_ref();
    let (app_name, app_dir) = (&self.input.app_name, &self.input.app_dir);

    if !chart.git_remote.is_empty() {
      let Some(git) = self.git.as_ref() else {
        return Err(TemplateError::Template(LoaderError::NoGitClient.to_string()));
      };
      let remote = RemoteGitChart {
        git_remote: chart.git_remote.clone(),
        git_ref: chart.git_ref.clone(),
        path: chart.path.clone(),
      };
      return helm
        .template_remote_git_chart(app_name, app_dir, &input.namespace, &remote, git.as_ref(), opts)
        .await;
    }

    if !chart.repository.is_empty() {
      let remote = RemoteChart {
        repository: chart.repository.clone(),
        name: chart.name.clone(),
        version: chart.version.clone(),
        insecure: chart.insecure,
      };
      return helm
        .template_remote_chart(app_name, app_dir, &input.namespace, &remote, self.chart_repos.as_ref(), opts)
        .await;
    }

    helm
      .template_local_chart(app_name, app_dir, &input.namespace, &chart.path, opts)
      .await
  }
}

/// Load plain manifest files from `dir`.
///
/// With an explicit `names` list only those files are read. Otherwise every
/// `.yaml`, `.yml` and `.json` file directly inside `dir` is read, except the
/// application config file.
pub fn load_plain_yaml_manifests(dir: &Path, names: &[String], config_filename: &str) -> Result<Vec<Manifest>, LoaderError> {
  let files: Vec<PathBuf> = if names.is_empty() {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
      let entry = entry.map_err(|e| LoaderError::ReadDir {
        path: dir.to_path_buf(),
        source: e.into(),
      })?;
      if !entry.file_type().is_file() {
        continue;
      }
      let name = entry.file_name().to_string_lossy();
      if name == config_filename {
        continue;
      }
      let ext = entry.path().extension().and_then(|e| e.to_str()).unwrap_or_default();
      if matches!(ext, "yaml" | "yml" | "json") {
        files.push(entry.path().to_path_buf());
      }
    }
    files
  } else {
    names.iter().map(|name| dir.join(name)).collect()
  };

  let mut manifests = Vec::new();
  for file in files {
    manifests.extend(load_manifests_from_file(&file)?);
  }
  Ok(manifests)
}

/// Stable sort by the integer `pipecd.dev/order` annotation.
///
/// Missing or malformed values sort as 0.
pub fn sort_manifests(manifests: &mut [Manifest]) {
  manifests.sort_by_key(|m| {
    m.annotation(ANNOTATION_ORDER)
      .and_then(|v| v.trim().parse::<i64>().ok())
      .unwrap_or(0)
  });
}

/// Fill in each key's namespace.
///
/// Namespaced kinds take `namespace` when it is set, otherwise keep their own
/// (already defaulted to `default`). Cluster-scoped kinds get none.
pub fn resolve_namespaces(manifests: &mut [Manifest], namespace: &str, scopes: &NamespaceScopes) {
  for m in manifests.iter_mut() {
    if !scopes.is_namespaced(&m.key.api_version, &m.key.kind) {
      m.set_key_namespace("");
    } else if !namespace.is_empty() {
      m.set_key_namespace(namespace);
    }
  }
}
