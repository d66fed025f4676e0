//! Tool command implementation.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use piped_lib::toolregistry::Registry;

use crate::output::{format_duration, print_success};

/// Install `name` at `version` (the default when empty) unless the tools
/// directory already has it, then print the binary path.
pub fn cmd_tool_ensure(name: &str, version: &str, tools_dir: &Path) -> Result<()> {
  let registry = Registry::new(tools_dir).context("Failed to initialize tool registry")?;

  let started = Instant::now();
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let ensured = rt
    .block_on(registry.ensure(name, version))
    .with_context(|| format!("Failed to ensure {}", name))?;

  if ensured.installed {
    print_success(&format!("Installed {} in {}", name, format_duration(started.elapsed())));
  }
  println!("{}", ensured.path.display());
  Ok(())
}
