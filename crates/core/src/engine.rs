//! Declarative container images and the engine that runs them.
//!
//! An [`Image`] is a base reference plus an ordered list of [`BuildStep`]s.
//! Building one never touches a container runtime; only a
//! [`ContainerEngine`] replays the steps and executes a command on top.

use async_trait::async_trait;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;

/// One instruction applied on top of the previous image state.
#[derive(Debug, Clone)]
pub enum BuildStep {
    /// Run a command and keep its filesystem changes.
    Exec {
        /// Command and arguments
        args: Vec<String>,
    },
    /// Replace the image entrypoint; empty clears it.
    Entrypoint {
        /// Entrypoint command and arguments
        args: Vec<String>,
    },
    /// Set an environment variable.
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
        /// Expand `$VAR` references against the image's current environment
        expand: bool,
    },
    /// Set an environment variable from a secret.
    SecretEnv {
        /// Variable name
        name: String,
        /// Secret value
        value: Arc<SecretString>,
    },
    /// Mount a named cache volume.
    MountCache {
        /// Mount path inside the container
        path: String,
        /// Cache volume name
        volume: String,
    },
    /// Mount a host directory.
    MountHostDirectory {
        /// Host directory
        host: PathBuf,
        /// Mount path inside the container
        path: String,
    },
    /// Copy a host file, keeping its permissions.
    CopyFile {
        /// Host file
        host: PathBuf,
        /// Destination path inside the container
        path: String,
    },
    /// Merge a host directory's contents into a container directory.
    CopyDirectory {
        /// Host directory
        host: PathBuf,
        /// Destination directory inside the container
        path: String,
    },
    /// Change the working directory.
    Workdir {
        /// Working directory
        path: String,
    },
}

/// A container image described as a base plus ordered build steps.
#[derive(Debug, Clone)]
pub struct Image {
    base: String,
    steps: Vec<BuildStep>,
}

impl Image {
    /// Start an image from a base reference such as `alpine:3.17.3`.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            steps: Vec::new(),
        }
    }

    /// The base image reference.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The build steps in application order.
    #[must_use]
    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }

    /// Append a raw step.
    #[must_use]
    pub fn with_step(mut self, step: BuildStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Run a command as a build step.
    #[must_use]
    pub fn with_exec<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_step(BuildStep::Exec {
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// Replace the entrypoint.
    #[must_use]
    pub fn with_entrypoint<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_step(BuildStep::Entrypoint {
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// Set a literal environment variable.
    #[must_use]
    pub fn with_env_variable(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_step(BuildStep::Env {
            name: name.into(),
            value: value.into(),
            expand: false,
        })
    }

    /// Set a variable whose `$VAR` references resolve against the image environment.
    #[must_use]
    pub fn with_expanded_env_variable(
        self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.with_step(BuildStep::Env {
            name: name.into(),
            value: value.into(),
            expand: true,
        })
    }

    /// Set an environment variable from a secret.
    #[must_use]
    pub fn with_secret_variable(self, name: impl Into<String>, value: Arc<SecretString>) -> Self {
        self.with_step(BuildStep::SecretEnv {
            name: name.into(),
            value,
        })
    }

    /// Mount a named cache volume at `path`.
    #[must_use]
    pub fn with_mounted_cache(self, path: impl Into<String>, volume: impl Into<String>) -> Self {
        self.with_step(BuildStep::MountCache {
            path: path.into(),
            volume: volume.into(),
        })
    }

    /// Mount a host directory at `path`.
    #[must_use]
    pub fn with_mounted_directory(self, path: impl Into<String>, host: impl Into<PathBuf>) -> Self {
        self.with_step(BuildStep::MountHostDirectory {
            host: host.into(),
            path: path.into(),
        })
    }

    /// Copy a host file to `path`.
    #[must_use]
    pub fn with_file(self, path: impl Into<String>, host: impl Into<PathBuf>) -> Self {
        self.with_step(BuildStep::CopyFile {
            host: host.into(),
            path: path.into(),
        })
    }

    /// Merge a host directory into `path`.
    #[must_use]
    pub fn with_directory(self, path: impl Into<String>, host: impl Into<PathBuf>) -> Self {
        self.with_step(BuildStep::CopyDirectory {
            host: host.into(),
            path: path.into(),
        })
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_workdir(self, path: impl Into<String>) -> Self {
        self.with_step(BuildStep::Workdir { path: path.into() })
    }

    /// Forward host environment variables whose name starts with `prefix`
    /// or is listed in `extra`.
    #[must_use]
    pub fn with_host_env_matching_prefix(self, prefix: &str, extra: &[&str]) -> Self {
        self.with_env_matching_prefix(std::env::vars(), prefix, extra)
    }

    /// Like [`Image::with_host_env_matching_prefix`] over an explicit variable set.
    ///
    /// Variables are applied in name order so the image is reproducible.
    #[must_use]
    pub fn with_env_matching_prefix<I>(mut self, vars: I, prefix: &str, extra: &[&str]) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut selected: Vec<(String, String)> = vars
            .into_iter()
            .filter(|(name, _)| name.starts_with(prefix) || extra.contains(&name.as_str()))
            .collect();
        selected.sort();
        selected.dedup_by(|a, b| a.0 == b.0);
        for (name, value) in selected {
            self = self.with_env_variable(name, value);
        }
        self
    }
}

/// Result of running a command in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A runtime that can materialize an [`Image`] and run a command in it.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;

    /// Replay `image` and execute `command` on top of it.
    ///
    /// A non-zero exit is reported through [`ExecOutput::exit_code`], not as an error.
    async fn run(&self, image: &Image, command: &[String]) -> Result<ExecOutput>;
}
