//! Running external command-line tools.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
  pub success: bool,
  pub code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

impl ToolOutput {
  /// stdout followed by stderr.
  pub fn combined(&self) -> String {
    let mut out = self.stdout.clone();
    out.push_str(&self.stderr);
    out
  }
}

/// Run `program` with `args`, optionally in `dir` and feeding `stdin`.
///
/// The child is killed when the returned future is dropped, which is how
/// callers cancel a running tool.
pub async fn run_tool<I, S>(
  program: &Path,
  args: I,
  dir: Option<&Path>,
  stdin: Option<&[u8]>,
) -> std::io::Result<ToolOutput>
where
  I: IntoIterator<Item = S>,
  S: AsRef<OsStr>,
{
  let mut command = Command::new(program);
  command
    .args(args)
    .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
  if let Some(dir) = dir {
    command.current_dir(dir);
  }

  let mut child = command.spawn()?;
  if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
    pipe.write_all(data).await?;
    pipe.shutdown().await?;
  }

  let output = child.wait_with_output().await?;
  Ok(ToolOutput {
    success: output.status.success(),
    code: output.status.code(),
    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
  })
}
