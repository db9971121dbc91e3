//! Error types for tag discovery, toolchain assembly and orchestration.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kubetools operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing and assembling toolchains.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A repository could not be cloned, updated or have its tags listed.
    #[error("Could not get repository: {repository}; reason: {message}")]
    #[diagnostic(
        code(kubetools::fetch),
        help("Check the repository URL and that the configured ref exists")
    )]
    Fetch {
        /// Location of the repository
        repository: String,
        /// Underlying cause
        message: String,
    },

    /// No release tags remained after filtering.
    #[error("No release tags found for repository: {repository}")]
    #[diagnostic(code(kubetools::empty_tag_set))]
    EmptyTagSet {
        /// Location of the repository
        repository: String,
    },

    /// The compared repositories have no release tag in common.
    #[error("No matching versions between repositories: {}", repositories.join(", "))]
    #[diagnostic(
        code(kubetools::no_matching_versions),
        help("The compared repositories must share at least one release tag")
    )]
    NoMatchingVersions {
        /// Locations of the compared repositories
        repositories: Vec<String>,
    },

    /// The artifact URL does not name a supported archive type.
    #[error("Unsupported archive format for download: {url}")]
    #[diagnostic(
        code(kubetools::unsupported_archive_format),
        help("Supported artifacts are raw executables (no extension), .gz tarballs and .zip archives")
    )]
    UnsupportedArchiveFormat {
        /// The offending download URL
        url: String,
    },

    /// An installed binary failed its smoke test.
    #[error("Verification command `{}` failed (exit code {exit_code:?})", command.join(" "))]
    #[diagnostic(code(kubetools::verification_failed))]
    VerificationFailed {
        /// The verification command
        command: Vec<String>,
        /// Exit code when the command ran to completion
        exit_code: Option<i32>,
        /// Captured stdout
        stdout: String,
        /// Captured stderr, or the engine error when the command did not run
        stderr: String,
    },

    /// A toolchain build step failed.
    #[error("Toolchain {plan} failed at step {step} ({tool})")]
    #[diagnostic(code(kubetools::assembly_failed))]
    AssemblyFailed {
        /// Label of the build plan (usually the matched version)
        plan: String,
        /// 1-based position of the failing step
        step: usize,
        /// Name of the tool installed by the failing step
        tool: String,
        /// The step failure
        #[source]
        source: Box<Error>,
    },

    /// An artifact download failed for good.
    #[error("Download of {url} failed after {attempts} attempt(s): {message}")]
    #[diagnostic(code(kubetools::download))]
    Download {
        /// The download URL
        url: String,
        /// Attempts made before giving up
        attempts: usize,
        /// Last error message
        message: String,
    },

    /// The container engine reported an error.
    #[error("{engine} engine error: {message}")]
    #[diagnostic(code(kubetools::engine))]
    Engine {
        /// Engine name
        engine: String,
        /// Error message
        message: String,
    },

    /// A pipeline command exited with a non-zero status.
    #[error("Command `{}` exited with code {exit_code}", command.join(" "))]
    #[diagnostic(code(kubetools::command_failed))]
    CommandFailed {
        /// The command
        command: Vec<String>,
        /// Exit code
        exit_code: i32,
        /// Captured stderr
        stderr: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kubetools::config), help("Check the kubetools configuration file"))]
    Configuration {
        /// The error message
        message: String,
    },

    /// Work stopped because a sibling task failed.
    #[error("Cancelled")]
    #[diagnostic(code(kubetools::cancelled))]
    Cancelled,

    /// A spawned task panicked.
    #[error("Task '{name}' panicked: {message}")]
    #[diagnostic(code(kubetools::task_panicked))]
    TaskPanicked {
        /// Task name
        name: String,
        /// Panic description
        message: String,
    },

    /// I/O error on a known path.
    #[error("I/O error on {}: {source}", path.display())]
    #[diagnostic(code(kubetools::io))]
    Io {
        /// The path being accessed
        path: PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a fetch error for a repository.
    #[must_use]
    pub fn fetch(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            repository: repository.into(),
            message: message.into(),
        }
    }

    /// Create an empty tag set error.
    #[must_use]
    pub fn empty_tag_set(repository: impl Into<String>) -> Self {
        Self::EmptyTagSet {
            repository: repository.into(),
        }
    }

    /// Create an unsupported archive format error.
    #[must_use]
    pub fn unsupported_archive_format(url: impl Into<String>) -> Self {
        Self::UnsupportedArchiveFormat { url: url.into() }
    }

    /// Create a download error.
    #[must_use]
    pub fn download(url: impl Into<String>, attempts: usize, message: impl Into<String>) -> Self {
        Self::Download {
            url: url.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create an engine error.
    #[must_use]
    pub fn engine(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            engine: engine.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an I/O error for a path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a step failure with its position in a build plan.
    #[must_use]
    pub fn assembly_failed(
        plan: impl Into<String>,
        step: usize,
        tool: impl Into<String>,
        source: Self,
    ) -> Self {
        Self::AssemblyFailed {
            plan: plan.into(),
            step,
            tool: tool.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error only reports cancellation, possibly wrapped in step context.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::AssemblyFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
