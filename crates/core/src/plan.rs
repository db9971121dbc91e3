//! Toolchain build plans and the binary specs they are made of.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// Where installed executables land unless a spec says otherwise.
pub const DEFAULT_INSTALL_DIR: &str = "/usr/local/bin";

/// How a downloaded artifact becomes an installed binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    /// The download is the executable itself.
    RawExecutable,
    /// A gzip-compressed tar archive.
    GzipTar,
    /// A zip archive.
    Zip,
}

impl InstallKind {
    /// Detect the install kind from the file name at the end of `url`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedArchiveFormat` for any extension other than
    /// none, `.gz` or `.zip`.
    pub fn from_url(url: &str) -> Result<Self> {
        let file_name = artifact_file_name(url);
        match Path::new(file_name).extension().and_then(|ext| ext.to_str()) {
            None => Ok(Self::RawExecutable),
            Some("gz") => Ok(Self::GzipTar),
            Some("zip") => Ok(Self::Zip),
            Some(_) => Err(Error::unsupported_archive_format(url)),
        }
    }

    /// Whether the artifact must be unpacked.
    #[must_use]
    pub fn is_archive(self) -> bool {
        !matches!(self, Self::RawExecutable)
    }
}

impl fmt::Display for InstallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawExecutable => write!(f, "raw-executable"),
            Self::GzipTar => write!(f, "gzip-tar-archive"),
            Self::Zip => write!(f, "zip-archive"),
        }
    }
}

/// Last path segment of `url`, ignoring any query string or fragment.
#[must_use]
pub fn artifact_file_name(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = url[..end].trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}

/// An environment variable applied after a binary is installed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvSetting {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
    /// Expand `$VAR` references against the image environment
    #[serde(default)]
    pub expand: bool,
}

impl EnvSetting {
    /// A literal variable.
    #[must_use]
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expand: false,
        }
    }

    /// A variable expanded against the image environment.
    #[must_use]
    pub fn expanded(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expand: true,
        }
    }
}

/// A fully resolved binary to install into an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinarySpec {
    /// Tool name, used in diagnostics
    pub name: String,
    /// Concrete artifact URL
    pub download_url: String,
    /// How to install the artifact
    pub install_kind: InstallKind,
    /// Smoke test run after install
    pub verify: Vec<String>,
    /// Target directory inside the image
    pub install_dir: String,
    /// Leading path components dropped from archive entries
    pub strip_components: usize,
    /// Variables applied after install
    pub env: Vec<EnvSetting>,
}

impl BinarySpec {
    /// Create a spec, detecting the install kind from the URL.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedArchiveFormat` when the URL names an unknown archive type.
    pub fn new<I, S>(name: impl Into<String>, download_url: impl Into<String>, verify: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let download_url = download_url.into();
        Ok(Self {
            name: name.into(),
            install_kind: InstallKind::from_url(&download_url)?,
            download_url,
            verify: verify.into_iter().map(Into::into).collect(),
            install_dir: DEFAULT_INSTALL_DIR.to_string(),
            strip_components: 0,
            env: Vec::new(),
        })
    }

    /// Install into `install_dir` instead of the default.
    #[must_use]
    pub fn with_install_dir(mut self, install_dir: impl Into<String>) -> Self {
        self.install_dir = install_dir.into();
        self
    }

    /// Drop leading archive path components.
    #[must_use]
    pub fn with_strip_components(mut self, strip_components: usize) -> Self {
        self.strip_components = strip_components;
        self
    }

    /// Apply a variable after install.
    #[must_use]
    pub fn with_env(mut self, env: EnvSetting) -> Self {
        self.env.push(env);
        self
    }

    /// File name of the downloaded artifact.
    #[must_use]
    pub fn file_name(&self) -> &str {
        artifact_file_name(&self.download_url)
    }
}

/// Where a tool's version comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolVersion {
    /// The version matched across the compared repositories.
    #[default]
    Matched,
    /// A fixed version.
    Pinned {
        /// The version string substituted for `{version}`
        version: String,
    },
    /// The latest release tag of a configured repository.
    Latest {
        /// Repository name from the configuration
        repository: String,
    },
}

fn default_install_dir() -> String {
    DEFAULT_INSTALL_DIR.to_string()
}

/// A configurable recipe producing a [`BinarySpec`] once versions are known.
///
/// The URL may reference `{version}`, `{os}` and `{arch}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolTemplate {
    /// Tool name
    pub name: String,
    /// URL template
    pub url: String,
    /// Version source
    #[serde(default)]
    pub version: ToolVersion,
    /// Smoke test run after install
    #[serde(default)]
    pub verify: Vec<String>,
    /// Target directory inside the image
    #[serde(default = "default_install_dir")]
    pub install_dir: String,
    /// Leading path components dropped from archive entries
    #[serde(default)]
    pub strip_components: usize,
    /// Variables applied after install
    #[serde(default)]
    pub env: Vec<EnvSetting>,
}

/// Values substituted into tool templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// Target operating system, e.g. `linux`
    pub os: &'a str,
    /// Target architecture, e.g. `amd64`
    pub arch: &'a str,
    /// Version matched across repositories, when building a matched toolchain
    pub matched: Option<&'a str>,
    /// Latest tag per repository name
    pub latest: &'a HashMap<String, String>,
}

impl ToolTemplate {
    /// Create a template installed into the default directory.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, url: impl Into<String>, version: ToolVersion, verify: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            url: url.into(),
            version,
            verify: verify.into_iter().map(Into::into).collect(),
            install_dir: default_install_dir(),
            strip_components: 0,
            env: Vec::new(),
        }
    }

    /// Install into `install_dir` instead of the default.
    #[must_use]
    pub fn with_install_dir(mut self, install_dir: impl Into<String>) -> Self {
        self.install_dir = install_dir.into();
        self
    }

    /// Drop leading archive path components.
    #[must_use]
    pub fn with_strip_components(mut self, strip_components: usize) -> Self {
        self.strip_components = strip_components;
        self
    }

    /// Apply a variable after install.
    #[must_use]
    pub fn with_env(mut self, env: EnvSetting) -> Self {
        self.env.push(env);
        self
    }

    /// Repository whose latest tag this template needs, if any.
    #[must_use]
    pub fn latest_repository(&self) -> Option<&str> {
        match &self.version {
            ToolVersion::Latest { repository } => Some(repository),
            _ => None,
        }
    }

    /// Resolve the template into a concrete [`BinarySpec`].
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the version source is unavailable in
    /// `ctx`, and `UnsupportedArchiveFormat` when the URL names an unknown
    /// archive type.
    pub fn resolve(&self, ctx: &TemplateContext<'_>) -> Result<BinarySpec> {
        let version = match &self.version {
            ToolVersion::Matched => ctx.matched.ok_or_else(|| {
                Error::configuration(format!(
                    "Tool '{}' uses the matched version, which is only available in the containers pipeline",
                    self.name
                ))
            })?,
            ToolVersion::Pinned { version } => version.as_str(),
            ToolVersion::Latest { repository } => {
                ctx.latest.get(repository).map(String::as_str).ok_or_else(|| {
                    Error::configuration(format!(
                        "Tool '{}' needs the latest tag of '{}', which was not fetched",
                        self.name, repository
                    ))
                })?
            }
        };

        let url = self
            .url
            .replace("{version}", version)
            .replace("{os}", ctx.os)
            .replace("{arch}", ctx.arch);

        let mut spec = BinarySpec::new(&self.name, url, self.verify.iter().cloned())?
            .with_install_dir(&self.install_dir)
            .with_strip_components(self.strip_components);
        spec.env.clone_from(&self.env);
        Ok(spec)
    }
}

/// Everything needed to assemble one toolchain image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainBuildPlan {
    /// Identifies the plan in logs and errors, usually the matched version
    pub label: String,
    /// Base image reference
    pub base_image: String,
    /// Binaries installed in order
    pub steps: Vec<BinarySpec>,
}

impl ToolchainBuildPlan {
    /// Create a plan.
    #[must_use]
    pub fn new(label: impl Into<String>, base_image: impl Into<String>, steps: Vec<BinarySpec>) -> Self {
        Self {
            label: label.into(),
            base_image: base_image.into(),
            steps,
        }
    }

    /// Resolve every template against `ctx` into a plan.
    ///
    /// # Errors
    ///
    /// Propagates the first [`ToolTemplate::resolve`] failure.
    pub fn from_templates(
        label: impl Into<String>,
        base_image: impl Into<String>,
        templates: &[ToolTemplate],
        ctx: &TemplateContext<'_>,
    ) -> Result<Self> {
        let steps = templates
            .iter()
            .map(|template| template.resolve(ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(label, base_image, steps))
    }
}

/// Final status of one build plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Every binary installed and verified.
    Success,
    /// The plan failed.
    Failure {
        /// Rendered error
        detail: String,
    },
}

/// Result of one toolchain build, recorded once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    label: String,
    status: OutcomeStatus,
}

impl BuildOutcome {
    /// A successful build.
    #[must_use]
    pub fn success(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            status: OutcomeStatus::Success,
        }
    }

    /// A failed build.
    #[must_use]
    pub fn failure(label: impl Into<String>, error: &Error) -> Self {
        Self {
            label: label.into(),
            status: OutcomeStatus::Failure {
                detail: error.to_string(),
            },
        }
    }

    /// Plan label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Build status.
    #[must_use]
    pub fn status(&self) -> &OutcomeStatus {
        &self.status
    }

    /// Whether the build succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success)
    }
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            OutcomeStatus::Success => write!(f, "{}: ok", self.label),
            OutcomeStatus::Failure { detail } => write!(f, "{}: failed: {detail}", self.label),
        }
    }
}
