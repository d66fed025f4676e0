//! `helm template` for local, git-hosted and repository charts.
//!
//! [`TemplateError`] is shared with the kustomize wrapper.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::chartrepo::{ChartRepoError, ChartRepos};
use crate::config::InputHelmOptions;
use crate::git::{GitClient, GitError};
use crate::metrics::record_tool_call;
use crate::toolregistry::HELM;
use crate::util::process::run_tool;

const ALLOWED_URL_SCHEMES: &[&str] = &["http", "https"];

/// Text helm prints when a repository index is stale.
const STALE_INDEX_HINT: &str = "helm repo update";

#[derive(Debug, Error)]
pub enum TemplateError {
  #[error("failed to run templating tool: {0}")]
  Spawn(#[from] std::io::Error),

  #[error("templating failed: {0}")]
  Template(String),

  #[error("values file {0} references outside the application directory")]
  ValuesOutsideAppDir(String),

  #[error("scheme {0} is not allowed to load values file")]
  ValuesScheme(String),

  #[error("unable to prepare remote chart: {0}")]
  Git(#[from] GitError),

  #[error("unable to create a temporary directory: {0}")]
  TempDir(std::io::Error),

  #[error("failed to update chart repositories: {0}")]
  ChartRepo(#[from] ChartRepoError),
}

/// A chart kept in a git repository other than the application's.
#[derive(Debug, Clone, Default)]
pub struct RemoteGitChart {
  pub git_remote: String,
  pub git_ref: String,
  pub path: String,
}

/// A chart published in an added chart repository.
#[derive(Debug, Clone, Default)]
pub struct RemoteChart {
  pub repository: String,
  pub name: String,
  pub version: String,
  pub insecure: bool,
}

pub struct Helm {
  version: String,
  exec_path: PathBuf,
}

impl Helm {
  pub fn new(version: impl Into<String>, exec_path: impl Into<PathBuf>) -> Self {
    Self {
      version: version.into(),
      exec_path: exec_path.into(),
    }
  }

  pub async fn template_local_chart(
    &self,
    app_name: &str,
    app_dir: &Path,
    namespace: &str,
    chart_path: &str,
    opts: Option<&InputHelmOptions>,
  ) -> Result<String, TemplateError> {
    let mut args = vec![
      "template".to_string(),
      "--no-hooks".to_string(),
      "--include-crds".to_string(),
      release_name(app_name, opts),
      chart_path.to_string(),
    ];
    if !namespace.is_empty() {
      args.push(format!("--namespace={}", namespace));
    }
    append_options(&mut args, app_dir, opts)?;

    info!(app = %app_name, args = ?args, "start templating a local chart");
    self.run(app_dir, &args).await
  }

  pub async fn template_remote_git_chart(
    &self,
    app_name: &str,
    app_dir: &Path,
    namespace: &str,
    chart: &RemoteGitChart,
    git: &dyn GitClient,
    opts: Option<&InputHelmOptions>,
  ) -> Result<String, TemplateError> {
    let repo_dir = tempfile::Builder::new()
      .prefix("helm-remote-chart")
      .tempdir()
      .map_err(TemplateError::TempDir)?;
    git.clone_into(&chart.git_remote, &chart.git_ref, repo_dir.path()).await?;

    let chart_path = repo_dir.path().join(&chart.path);
    self
      .template_local_chart(app_name, app_dir, namespace, &chart_path.to_string_lossy(), opts)
      .await
  }

  /// Template a chart from a chart repository.
  ///
  /// When helm reports a stale index the repositories are refreshed once
  /// and the command retried.
  pub async fn template_remote_chart(
    &self,
    app_name: &str,
    app_dir: &Path,
    namespace: &str,
    chart: &RemoteChart,
    chart_repos: Option<&Arc<ChartRepos>>,
    opts: Option<&InputHelmOptions>,
  ) -> Result<String, TemplateError> {
    let mut args = vec![
      "template".to_string(),
      "--no-hooks".to_string(),
      "--include-crds".to_string(),
      release_name(app_name, opts),
      format!("{}/{}", chart.repository, chart.name),
      format!("--version={}", chart.version),
    ];
    if chart.insecure {
      args.push("--insecure-skip-tls-verify".to_string());
    }
    if !namespace.is_empty() {
      args.push(format!("--namespace={}", namespace));
    }
    append_options(&mut args, app_dir, opts)?;

    info!(app = %app_name, args = ?args, "start templating a chart from helm repository");
    let err = match self.run(app_dir, &args).await {
      Ok(out) => return Ok(out),
      Err(err) => err,
    };
    let (TemplateError::Template(message), Some(chart_repos)) = (&err, chart_repos) else {
      return Err(err);
    };
    if !message.contains(STALE_INDEX_HINT) {
      return Err(err);
    }

    if let Err(e) = chart_repos.update().await {
      error!(error = %e, "failed to update helm chart repositories");
      return Err(err);
    }
    self.run(app_dir, &args).await
  }

  async fn run(&self, app_dir: &Path, args: &[String]) -> Result<String, TemplateError> {
    let result = run_tool(&self.exec_path, args, Some(app_dir), None).await;
    record_tool_call(HELM, &self.version, "template", matches!(&result, Ok(out) if out.success));
    let out = result?;
    if !out.success {
      return Err(TemplateError::Template(format!(
        "exit code {:?}: {}",
        out.code,
        out.stderr.trim()
      )));
    }
    Ok(out.stdout)
  }
}

fn release_name(app_name: &str, opts: Option<&InputHelmOptions>) -> String {
  match opts {
    Some(opts) if !opts.release_name.is_empty() => opts.release_name.clone(),
    _ => app_name.to_string(),
  }
}

fn append_options(args: &mut Vec<String>, app_dir: &Path, opts: Option<&InputHelmOptions>) -> Result<(), TemplateError> {
  let Some(opts) = opts else {
    return Ok(());
  };
  for values in &opts.value_files {
    if let Err(err) = verify_values_file_path(app_dir, values) {
      error!(error = %err, "failed to verify values file path");
      return Err(err);
    }
    args.extend(["-f".to_string(), values.clone()]);
  }
  for (key, file) in &opts.set_files {
    args.extend(["--set-file".to_string(), format!("{}={}", key, file)]);
  }
  for api_version in &opts.api_versions {
    args.extend(["--api-versions".to_string(), api_version.clone()]);
  }
  if !opts.kube_version.is_empty() {
    args.extend(["--kube-version".to_string(), opts.kube_version.clone()]);
  }
  Ok(())
}

/// Reject values files that could read outside the application directory.
///
/// URLs are allowed for http(s) only. Local paths must be relative and stay
/// inside `app_dir` after resolving a symlink.
pub fn verify_values_file_path(app_dir: &Path, values: &str) -> Result<(), TemplateError> {
  if let Some((scheme, _)) = values.split_once("://") {
    let is_scheme = !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c));
    if is_scheme {
      if ALLOWED_URL_SCHEMES.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
        return Ok(());
      }
      return Err(TemplateError::ValuesScheme(scheme.to_string()));
    }
  }

  let requested = Path::new(values);
  if requested.is_absolute() {
    return Err(TemplateError::ValuesOutsideAppDir(values.to_string()));
  }

  let mut path = normalize(&app_dir.join(requested));
  let is_symlink = std::fs::symlink_metadata(&path)
    .map(|meta| meta.file_type().is_symlink())
    .unwrap_or(false);
  if is_symlink {
    if let Ok(target) = std::fs::read_link(&path) {
      path = if target.is_absolute() {
        normalize(&target)
      } else {
        normalize(&path.parent().unwrap_or(app_dir).join(target))
      };
    }
  }

  if !path.starts_with(normalize(app_dir)) {
    return Err(TemplateError::ValuesOutsideAppDir(values.to_string()));
  }
  Ok(())
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
  use std::path::Component;

  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn values_file_validation() {
    let temp = TempDir::new().unwrap();
    let app_dir = temp.path().join("app");
    std::fs::create_dir_all(&app_dir).unwrap();
    std::fs::write(app_dir.join("values.yaml"), "a: 1").unwrap();

    assert!(verify_values_file_path(&app_dir, "values.yaml").is_ok());
    assert!(verify_values_file_path(&app_dir, "https://example.com/values.yaml").is_ok());
    assert!(matches!(
      verify_values_file_path(&app_dir, "file:///etc/passwd"),
      Err(TemplateError::ValuesScheme(_))
    ));
    assert!(matches!(
      verify_values_file_path(&app_dir, "/etc/passwd"),
      Err(TemplateError::ValuesOutsideAppDir(_))
    ));
    assert!(matches!(
      verify_values_file_path(&app_dir, "../../etc/passwd"),
      Err(TemplateError::ValuesOutsideAppDir(_))
    ));
  }

  #[test]
  #[cfg(unix)]
  fn values_symlink_escaping_app_dir_is_rejected() {
    let temp = TempDir::new().unwrap();
    let app_dir = temp.path().join("app");
    std::fs::create_dir_all(&app_dir).unwrap();
    std::os::unix::fs::symlink("/etc/hosts", app_dir.join("values.yaml")).unwrap();
    std::os::unix::fs::symlink("local.yaml", app_dir.join("alias.yaml")).unwrap();

    assert!(verify_values_file_path(&app_dir, "values.yaml").is_err());
    assert!(verify_values_file_path(&app_dir, "alias.yaml").is_ok());
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn template_local_chart_arguments() {
    let temp = TempDir::new().unwrap();
    let path = crate::util::testutil::recording_tool(temp.path(), "helm", "kind: ConfigMap\n", 0);
    let helm = Helm::new("3.8.2", path);

    let opts = InputHelmOptions {
      release_name: "rel".to_string(),
      value_files: vec!["values.yaml".to_string()],
      api_versions: vec!["monitoring.coreos.com/v1".to_string()],
      kube_version: "1.29.0".to_string(),
      ..Default::default()
    };
    let out = helm
      .template_local_chart("app", temp.path(), "ns", "chart", Some(&opts))
      .await
      .unwrap();
    assert_eq!(out, "kind: ConfigMap\n");
    assert_eq!(
      crate::util::testutil::recorded_args(temp.path(), "helm"),
      vec![
        "template --no-hooks --include-crds rel chart --namespace=ns -f values.yaml --api-versions monitoring.coreos.com/v1 --kube-version 1.29.0"
      ]
    );
  }
}
