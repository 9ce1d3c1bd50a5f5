//! Repository store.
//!
//! The server never manages repositories itself; it asks a
//! [`RepositoryStore`] whether one exists, where it lives, and to create it
//! when auto-create is enabled.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Errors that can occur while creating repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `git init` exited unsuccessfully.
    #[error("git init failed for {repo}: {stderr}")]
    InitFailed { repo: String, stderr: String },
}

/// Where repositories live and how they come into being.
///
/// Several requests may race to create the same repository; `create` must
/// succeed for all of them.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    /// Whether `repo` exists.
    async fn exists(&self, repo: &str) -> bool;

    /// Creates `repo`. Creating an existing repository is not an error.
    async fn create(&self, repo: &str) -> Result<(), StoreError>;

    /// Absolute on-disk path of `repo`.
    fn path(&self, repo: &str) -> PathBuf;
}

/// Bare repositories under a root directory.
#[derive(Debug, Clone)]
pub struct FsRepositoryStore {
    root: PathBuf,
    git: PathBuf,
}

impl FsRepositoryStore {
    /// Creates a store rooted at `root`, using `git` from `PATH`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git: PathBuf::from("git"),
        }
    }

    /// Uses a specific `git` executable for `git init`.
    pub fn with_git(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RepositoryStore for FsRepositoryStore {
    async fn exists(&self, repo: &str) -> bool {
        tokio::fs::metadata(self.path(repo))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn create(&self, repo: &str) -> Result<(), StoreError> {
        let path = self.path(repo);
        tokio::fs::create_dir_all(&path).await?;

        // Re-running `git init` on an existing repository only reinitialises
        // it, so concurrent creators all succeed.
        let output = Command::new(&self.git)
            .arg("init")
            .arg("--bare")
            .arg("--quiet")
            .arg(&path)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(StoreError::InitFailed {
                repo: repo.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::info!(repo = %repo, path = %path.display(), "created repository");
        Ok(())
    }

    fn path(&self, repo: &str) -> PathBuf {
        self.root.join(repo.trim_start_matches('/'))
    }
}
