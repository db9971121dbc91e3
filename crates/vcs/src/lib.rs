//! `git` command-line provider for repository sync and tag listing.
//!
//! Clones are partial (`--filter=blob:none`) and never check out a working
//! tree: kubetools only needs refs.

use async_trait::async_trait;
use kubetools_core::{Error, RepositoryRef, Result, VersionControl};
use std::ffi::OsStr;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Runs the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Use `git` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// Use a specific git executable.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn git<I, S>(&self, repo: &RepositoryRef, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        debug!(?command, "Running git");

        let output = command
            .output()
            .await
            .map_err(|e| Error::fetch(&repo.location, format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::fetch(
                &repo.location,
                format!("git exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn sync(&self, repo: &RepositoryRef, worktree: &Path) -> Result<()> {
        if worktree.join(".git").is_dir() {
            info!(repository = %repo, "Updating cached clone");
            self.git(
                repo,
                [
                    OsStr::new("-C"),
                    worktree.as_os_str(),
                    OsStr::new("fetch"),
                    OsStr::new("--tags"),
                    OsStr::new("--force"),
                    OsStr::new("origin"),
                    OsStr::new(&repo.reference),
                ],
            )
            .await?;
            return Ok(());
        }

        // Leftover of an interrupted clone.
        if worktree.exists() {
            tokio::fs::remove_dir_all(worktree)
                .await
                .map_err(|e| Error::io(worktree, e))?;
        }
        if let Some(parent) = worktree.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        info!(repository = %repo, "Cloning");
        self.git(
            repo,
            [
                OsStr::new("clone"),
                OsStr::new("--filter=blob:none"),
                OsStr::new("--no-checkout"),
                OsStr::new("--branch"),
                OsStr::new(&repo.reference),
                OsStr::new(&repo.location),
                worktree.as_os_str(),
            ],
        )
        .await?;
        self.git(
            repo,
            [
                OsStr::new("-C"),
                worktree.as_os_str(),
                OsStr::new("fetch"),
                OsStr::new("--tags"),
                OsStr::new("--force"),
                OsStr::new("origin"),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_tags(&self, repo: &RepositoryRef, worktree: &Path, pattern: &str) -> Result<Vec<String>> {
        let stdout = self
            .git(
                repo,
                [
                    OsStr::new("-C"),
                    worktree.as_os_str(),
                    OsStr::new("tag"),
                    OsStr::new("--list"),
                    OsStr::new(pattern),
                    OsStr::new("--sort=v:refname"),
                ],
            )
            .await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }
}
