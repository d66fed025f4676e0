//! Test helpers.
//!
//! External tools are replaced by small shell scripts written into a temp
//! directory. Scripts record their arguments and stdin into files next to
//! themselves so tests can assert on how the tool was called.

use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script named `name` into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.join(name);
  std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
  let mut perms = std::fs::metadata(&path).unwrap().permissions();
  perms.set_mode(0o755);
  std::fs::set_permissions(&path, perms).unwrap();
  path
}

/// A fake tool that appends its arguments (one call per line) to
/// `<dir>/<name>.args`, copies stdin to `<dir>/<name>.stdin`, prints
/// `output` and exits with `code`.
#[cfg(unix)]
pub fn recording_tool(dir: &Path, name: &str, output: &str, code: i32) -> PathBuf {
  let args = dir.join(format!("{}.args", name));
  let stdin = dir.join(format!("{}.stdin", name));
  let body = format!(
    "echo \"$@\" >> '{}'\nif [ ! -t 0 ]; then cat >> '{}'; fi\nprintf '%s' '{}'\nexit {}",
    args.display(),
    stdin.display(),
    output.replace('\'', "'\\''"),
    code
  );
  write_script(dir, name, &body)
}

/// Lines recorded by a [`recording_tool`].
pub fn recorded_args(dir: &Path, name: &str) -> Vec<String> {
  std::fs::read_to_string(dir.join(format!("{}.args", name)))
    .unwrap_or_default()
    .lines()
    .map(str::to_string)
    .collect()
}

pub fn recorded_stdin(dir: &Path, name: &str) -> String {
  std::fs::read_to_string(dir.join(format!("{}.stdin", name))).unwrap_or_default()
}

/// Recursively copy `src` into `dest`.
pub fn copy_dir(src: &Path, dest: &Path) {
  for entry in walkdir::WalkDir::new(src) {
    let entry = entry.unwrap();
    let rel = entry.path().strip_prefix(src).unwrap();
    let target = dest.join(rel);
    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&target).unwrap();
    } else {
      std::fs::copy(entry.path(), &target).unwrap();
    }
  }
}

/// [`GitClient`](crate::git::GitClient) over local directories.
///
/// `sync` hands out the checkout registered for a repository id and
/// `clone_into` treats the remote as a local path to copy.
#[derive(Default)]
pub struct FakeGit {
  checkouts: parking_lot::Mutex<std::collections::HashMap<String, crate::git::Checkout>>,
  clones: parking_lot::Mutex<Vec<String>>,
}

impl FakeGit {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_checkout(self, repo_id: &str, dir: &Path, commit: &str) -> Self {
    self.checkouts.lock().insert(
      repo_id.to_string(),
      crate::git::Checkout {
        dir: dir.to_path_buf(),
        commit: commit.to_string(),
      },
    );
    self
  }

  /// `remote@ref` of every clone.
  pub fn clones(&self) -> Vec<String> {
    self.clones.lock().clone()
  }
}

#[async_trait::async_trait]
impl crate::git::GitClient for FakeGit {
  async fn sync(&self, repo_id: &str, remote: &str, _branch: &str) -> Result<crate::git::Checkout, crate::git::GitError> {
    self
      .checkouts
      .lock()
      .get(repo_id)
      .cloned()
      .ok_or_else(|| crate::git::GitError::Clone {
        url: remote.to_string(),
        message: "unknown repository".to_string(),
      })
  }

  async fn clone_into(
    &self,
    remote: &str,
    git_ref: &str,
    dest: &Path,
  ) -> Result<crate::git::Checkout, crate::git::GitError> {
    copy_dir(Path::new(remote), dest);
    self.clones.lock().push(format!("{}@{}", remote, git_ref));
    Ok(crate::git::Checkout {
      dir: dest.to_path_buf(),
      commit: git_ref.to_string(),
    })
  }
}
