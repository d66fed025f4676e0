//! `kustomize build`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

use super::helm::TemplateError;
use crate::metrics::record_tool_call;
use crate::toolregistry::KUSTOMIZE;
use crate::util::process::run_tool;

pub struct Kustomize {
  version: String,
  exec_path: PathBuf,
}

impl Kustomize {
  pub fn new(version: impl Into<String>, exec_path: impl Into<PathBuf>) -> Self {
    Self {
      version: version.into(),
      exec_path: exec_path.into(),
    }
  }

  /// Build the kustomization in `app_dir`. Each option becomes `--<key>`
  /// followed by its value when the value is not empty.
  pub async fn template(
    &self,
    app_name: &str,
    app_dir: &Path,
    options: &BTreeMap<String, String>,
  ) -> Result<String, TemplateError> {
    let mut args = vec!["build".to_string(), ".".to_string()];
    for (key, value) in options {
      args.push(format!("--{}", key));
      if !value.is_empty() {
        args.push(value.clone());
      }
    }

    info!(app = %app_name, args = ?args, "start templating a kustomize application");
    let result = run_tool(&self.exec_path, &args, Some(app_dir), None).await;
    record_tool_call(KUSTOMIZE, &self.version, "build", matches!(&result, Ok(out) if out.success));
    let out = result?;
    if !out.success {
      return Err(TemplateError::Template(format!(
        "kustomize exit code {:?}: {}",
        out.code,
        out.stderr.trim()
      )));
    }
    Ok(out.stdout)
  }
}
