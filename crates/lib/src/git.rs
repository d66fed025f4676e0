//! Local clones of remote git repositories.
//!
//! Clones live under one cache directory, one subdirectory per repository
//! id. [`GitClient::sync`] clones on first use and afterwards fetches; when
//! the tracked branch moved, the worktree is re-cloned so the directory
//! always reflects the branch head.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gix::remote::Direction;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GitError {
  #[error("failed to prepare directory {path}: {source}")]
  Directory {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to clone repository {url}: {message}")]
  Clone { url: String, message: String },

  #[error("failed to open repository at {path}: {message}")]
  Open { path: PathBuf, message: String },

  #[error("failed to fetch from {url}: {message}")]
  Fetch { url: String, message: String },

  #[error("failed to resolve {rev}: {message}")]
  Resolve { rev: String, message: String },

  #[error("git task failed: {0}")]
  Join(String),
}

/// A checked-out revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
  pub dir: PathBuf,
  pub commit: String,
}

#[async_trait]
pub trait GitClient: Send + Sync {
  /// Bring the cached clone of `repo_id` up to date with `branch` and return
  /// its directory and head commit.
  async fn sync(&self, repo_id: &str, remote: &str, branch: &str) -> Result<Checkout, GitError>;

  /// Clone `remote` into `dest`, checking out `git_ref` when not empty.
  async fn clone_into(&self, remote: &str, git_ref: &str, dest: &Path) -> Result<Checkout, GitError>;
}

/// [`GitClient`] built on `gix`.
pub struct GixClient {
  cache_dir: PathBuf,
  repos: Mutex<HashMap<String, PathBuf>>,
}

impl GixClient {
  pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
    Self {
      cache_dir: cache_dir.into(),
      repos: Mutex::new(HashMap::new()),
    }
  }
}

#[async_trait]
impl GitClient for GixClient {
  async fn sync(&self, repo_id: &str, remote: &str, branch: &str) -> Result<Checkout, GitError> {
    let dir = self
      .repos
      .lock()
      .entry(repo_id.to_string())
      .or_insert_with(|| self.cache_dir.join(sanitize(repo_id)))
      .clone();
    let remote = remote.to_string();
    let branch = branch.to_string();

    tokio::task::spawn_blocking(move || sync_blocking(&dir, &remote, &branch))
      .await
      .map_err(|e| GitError::Join(e.to_string()))?
  }

  async fn clone_into(&self, remote: &str, git_ref: &str, dest: &Path) -> Result<Checkout, GitError> {
    let remote = remote.to_string();
    let git_ref = git_ref.to_string();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || {
      let repo = clone_repo(&remote, &git_ref, &dest)?;
      let commit = head_commit(&repo)?;
      Ok(Checkout { dir: dest, commit })
    })
    .await
    .map_err(|e| GitError::Join(e.to_string()))?
  }
}

fn sanitize(id: &str) -> String {
  id.chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect()
}

fn sync_blocking(dir: &Path, remote: &str, branch: &str) -> Result<Checkout, GitError> {
  if !dir.join(".git").exists() {
    info!(url = remote, path = %dir.display(), "cloning repository");
    let repo = clone_repo(remote, branch, dir)?;
    let commit = head_commit(&repo)?;
    return Ok(Checkout {
      dir: dir.to_path_buf(),
      commit,
    });
  }

  let repo = gix::open(dir).map_err(|e| GitError::Open {
    path: dir.to_path_buf(),
    message: e.to_string(),
  })?;
  let local = head_commit(&repo)?;
  fetch_updates(&repo, remote)?;

  let tracking = if branch.is_empty() {
    "refs/remotes/origin/HEAD".to_string()
  } else {
    format!("refs/remotes/origin/{}", branch)
  };
  let upstream = resolve_revision(&repo, &tracking)?;
  if upstream == local {
    debug!(url = remote, commit = %local, "repository is up to date");
    return Ok(Checkout {
      dir: dir.to_path_buf(),
      commit: local,
    });
  }

  // Swap in a fresh clone at the new head.
  info!(url = remote, from = %local, to = %upstream, "branch moved, refreshing clone");
  let parent = dir.parent().unwrap_or(dir);
  let staging = tempfile::Builder::new()
    .prefix(".refresh-")
    .tempdir_in(parent)
    .map_err(|source| GitError::Directory {
      path: parent.to_path_buf(),
      source,
    })?;
  let fresh = staging.path().join("repo");
  let repo = clone_repo(remote, branch, &fresh)?;
  let commit = head_commit(&repo)?;
  drop(repo);

  std::fs::remove_dir_all(dir).map_err(|source| GitError::Directory {
    path: dir.to_path_buf(),
    source,
  })?;
  std::fs::rename(&fresh, dir).map_err(|source| GitError::Directory {
    path: dir.to_path_buf(),
    source,
  })?;

  Ok(Checkout {
    dir: dir.to_path_buf(),
    commit,
  })
}

fn clone_repo(url: &str, git_ref: &str, dest: &Path) -> Result<gix::Repository, GitError> {
  let clone_err = |e: &dyn std::fmt::Display| GitError::Clone {
    url: url.to_string(),
    message: e.to_string(),
  };

  std::fs::create_dir_all(dest).map_err(|source| GitError::Directory {
    path: dest.to_path_buf(),
    source,
  })?;

  let mut prepared = gix::prepare_clone(url, dest).map_err(|e| clone_err(&e))?;
  if !git_ref.is_empty() {
    prepared = prepared.with_ref_name(Some(git_ref)).map_err(|e| clone_err(&e))?;
  }

  let (mut checkout, _outcome) = prepared
    .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| clone_err(&e))?;

  let (repo, _outcome) = checkout
    .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| clone_err(&e))?;

  Ok(repo)
}

fn fetch_updates(repo: &gix::Repository, url: &str) -> Result<(), GitError> {
  let fetch_err = |e: &dyn std::fmt::Display| GitError::Fetch {
    url: url.to_string(),
    message: e.to_string(),
  };

  let remote = repo
    .find_default_remote(Direction::Fetch)
    .ok_or_else(|| fetch_err(&"no remote configured"))?
    .map_err(|e| fetch_err(&e))?;

  remote
    .connect(Direction::Fetch)
    .map_err(|e| fetch_err(&e))?
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| fetch_err(&e))?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| fetch_err(&e))?;

  Ok(())
}

fn resolve_revision(repo: &gix::Repository, rev: &str) -> Result<String, GitError> {
  let resolve_err = |message: String| GitError::Resolve {
    rev: rev.to_string(),
    message,
  };
  let spec = repo.rev_parse(rev).map_err(|e| resolve_err(e.to_string()))?;
  let id = spec
    .single()
    .ok_or_else(|| resolve_err("ambiguous revision".to_string()))?;
  let commit = id
    .object()
    .map_err(|e| resolve_err(e.to_string()))?
    .peel_to_commit()
    .map_err(|e| resolve_err(e.to_string()))?;
  Ok(commit.id.to_string())
}

fn head_commit(repo: &gix::Repository) -> Result<String, GitError> {
  let resolve_err = |message: String| GitError::Resolve {
    rev: "HEAD".to_string(),
    message,
  };
  let mut head = repo.head().map_err(|e| resolve_err(e.to_string()))?;
  let commit = head.peel_to_commit().map_err(|e| resolve_err(e.to_string()))?;
  Ok(commit.id.to_string())
}
