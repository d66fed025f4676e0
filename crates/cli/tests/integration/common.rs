//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own temporary directory for manifests, application
/// directories and installed tools.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Write a file relative to the temp directory and return its path.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  pub fn path(&self, relative_path: &str) -> PathBuf {
    self.temp.path().join(relative_path)
  }

  /// Tools directory (isolated per test).
  pub fn tools_path(&self) -> PathBuf {
    let p = self.temp.path().join("tools");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Get a Command for the piped binary with `RUST_LOG` cleared so log
  /// filtering follows the `--verbose` flag.
  pub fn piped_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("piped");
    cmd.env_remove("RUST_LOG");
    cmd.current_dir(self.temp.path());
    cmd
  }
}

pub fn deployment(name: &str, replicas: u32, image: &str) -> String {
  format!(
    r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  namespace: default
spec:
  replicas: {replicas}
  template:
    spec:
      containers:
        - name: app
          image: {image}
"#
  )
}

pub fn config_map(name: &str, value: &str) -> String {
  format!(
    r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {name}
  namespace: default
data:
  key: {value}
"#
  )
}
