//! Implementation of the `piped run` command.
//!
//! Boots the tool registry, chart repositories, live-state stores and one
//! drift detector per platform provider, then runs until interrupted.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use piped_lib::chartrepo::ChartRepos;
use piped_lib::config::{PipedSpec, PlatformProviderConfig};
use piped_lib::driftdetector::{AppChecker, Detector, KubernetesChecker, LambdaChecker, LoggingReporter};
use piped_lib::git::{GitClient, GixClient};
use piped_lib::livestate::LiveStates;
use piped_lib::toolregistry::Registry;

use crate::output::{print_error, print_info, print_stat, print_warning};

pub fn cmd_run(config: &Path) -> Result<()> {
  let spec = PipedSpec::load(config).with_context(|| format!("Failed to load {}", config.display()))?;
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(run(spec))
}

async fn run(spec: PipedSpec) -> Result<()> {
  let registry = Arc::new(Registry::new(&spec.tools_dir).context("Failed to initialize tool registry")?);
  let chart_repos = Arc::new(ChartRepos::new(registry.clone()));
  chart_repos
    .add(&spec.http_chart_repositories())
    .await
    .context("Failed to add chart repositories")?;
  let git: Arc<dyn GitClient> = Arc::new(GixClient::new(spec.work_dir.join("repos")));

  let cancel = CancellationToken::new();
  let mut tasks = JoinSet::new();
  let states = LiveStates::start(&spec, cancel.child_token(), &mut tasks)
    .await
    .context("Failed to start live state stores")?;

  let reporter = Arc::new(LoggingReporter::new());
  for provider in &spec.platform_providers {
    let checker: Arc<dyn AppChecker> = match &provider.config {
      PlatformProviderConfig::Kubernetes(_) => {
        let store = states
          .kubernetes(&provider.name)
          .with_context(|| format!("No live state for provider {}", provider.name))?;
        Arc::new(
          KubernetesChecker::new(store, git.clone(), registry.clone())
            .with_chart_repos(chart_repos.clone(), spec.chart_repositories.clone()),
        )
      }
      PlatformProviderConfig::Lambda(_) => {
        let store = states
          .lambda(&provider.name)
          .with_context(|| format!("No live state for provider {}", provider.name))?;
        Arc::new(LambdaChecker::new(store, git.clone()))
      }
    };
    let detector = Detector::new(&provider.name, &spec, git.clone(), reporter.clone(), checker);
    let cancel = cancel.child_token();
    tasks.spawn(async move { detector.run(cancel).await });
  }

  if spec.platform_providers.is_empty() {
    print_warning("No platform providers are configured, nothing will be watched");
  }
  print_info(&format!("piped {} is running", spec.piped_id));
  print_stat("Providers", &spec.platform_providers.len().to_string());
  print_stat("Applications", &spec.applications.len().to_string());

  shutdown_signal().await;
  info!("shutting down");
  cancel.cancel();
  while let Some(joined) = tasks.join_next().await {
    if let Err(e) = joined {
      print_error(&format!("Background task failed: {}", e));
    }
  }
  Ok(())
}

async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
      Ok(mut term) => {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {}
          _ = term.recv() => {}
        }
      }
      Err(e) => {
        warn!(error = %e, "unable to listen for SIGTERM");
        let _ = tokio::signal::ctrl_c().await;
      }
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}
