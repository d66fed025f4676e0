//! Helm chart repositories.
//!
//! [`ChartRepos::add`] registers the configured HTTP repositories with
//! `helm repo add`. [`ChartRepos::update`] refreshes their indexes; only one
//! refresh runs at a time and concurrent callers share its outcome.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::HelmChartRepository;
use crate::metrics::record_tool_call;
use crate::singleflight;
use crate::toolregistry::{HELM, Registry, ToolRegistryError};
use crate::util::process::run_tool;

const UPDATE_KEY: &str = "update";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChartRepoError {
  #[error("no helm ({0})")]
  Tool(#[from] ToolRegistryError),

  #[error("failed to run helm: {0}")]
  Spawn(String),

  #[error("failed to add chart repository {name}: {output}")]
  Add { name: String, output: String },

  #[error("failed to update chart repositories: {0}")]
  Update(String),
}

pub struct ChartRepos {
  registry: Arc<Registry>,
  updates: singleflight::Group<(), ChartRepoError>,
}

impl ChartRepos {
  pub fn new(registry: Arc<Registry>) -> Self {
    Self {
      registry,
      updates: singleflight::Group::new(),
    }
  }

  /// Register every repository with the default helm binary.
  pub async fn add(&self, repos: &[HelmChartRepository]) -> Result<(), ChartRepoError> {
    let helm = self.registry.helm("").await?;
    for repo in repos {
      let mut args = vec!["repo".to_string(), "add".to_string(), repo.name.clone(), repo.address.clone()];
      if repo.insecure {
        args.push("--insecure-skip-tls-verify".to_string());
      }
      if !repo.username.is_empty() || !repo.password.is_empty() {
        args.extend(["--username".to_string(), repo.username.clone()]);
        args.extend(["--password".to_string(), repo.password.clone()]);
      }

      let result = run_tool(&helm.path, &args, None, None).await;
      record_tool_call(HELM, "", "repo-add", matches!(&result, Ok(out) if out.success));
      let out = result.map_err(|e| ChartRepoError::Spawn(e.to_string()))?;
      if !out.success {
        return Err(ChartRepoError::Add {
          name: repo.name.clone(),
          output: out.combined(),
        });
      }
      info!(name = %repo.name, address = %repo.address, "added chart repository");
    }
    Ok(())
  }

  /// Refresh all chart repository indexes.
  pub async fn update(&self) -> Result<(), ChartRepoError> {
    let registry = self.registry.clone();
    let (result, shared) = self
      .updates
      .work(UPDATE_KEY, move || async move {
        let helm = registry.helm("").await?;
        info!("start updating chart repositories");
        let result = run_tool(&helm.path, ["repo", "update"], None, None).await;
        record_tool_call(HELM, "", "repo-update", matches!(&result, Ok(out) if out.success));
        let out = result.map_err(|e| ChartRepoError::Spawn(e.to_string()))?;
        if !out.success {
          return Err(ChartRepoError::Update(out.combined()));
        }
        info!("successfully updated chart repositories");
        Ok(())
      })
      .await;
    if shared {
      info!("joined an in-flight chart repository update");
    }
    result
  }
}
