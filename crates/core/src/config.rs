//! Configuration for kubetools pipelines.
//!
//! Loaded once at startup from a TOML file (or defaults) and passed into the
//! pipelines unchanged. Every field has a default, so an empty file is valid.
//! Setting a table such as `[containers.repositories]` replaces the default
//! table as a whole.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::plan::{EnvSetting, ToolTemplate, ToolVersion};
use crate::tags::RepositoryRef;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root for the clone cache and the download staging area
    pub cache_dir: PathBuf,
    /// Download retry policy
    pub retry: RetryConfig,
    /// Matched-version toolchain images
    pub containers: ContainersConfig,
    /// Standalone tool images
    pub setup: SetupConfig,
    /// semantic-release run
    pub release: ReleaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("kubetools"),
            retry: RetryConfig::default(),
            containers: ContainersConfig::default(),
            setup: SetupConfig::default(),
            release: ReleaseConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the file cannot be read and `Configuration` when it
    /// does not parse or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        };

        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the document does not parse or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Clone cache root.
    #[must_use]
    pub fn repositories_dir(&self) -> PathBuf {
        self.cache_dir.join("repositories")
    }

    /// Download staging root.
    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::configuration("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::configuration("retry.backoff_multiplier must be at least 1.0"));
        }

        let containers = &self.containers;
        if containers.fanout == 0 {
            return Err(Error::configuration("containers.fanout must be at least 1"));
        }
        if containers.match_repositories.is_empty() {
            return Err(Error::configuration(
                "containers.match must name at least one repository",
            ));
        }
        for name in &containers.match_repositories {
            self.require_repository(name, "containers.match")?;
        }
        for tool in &containers.tools {
            self.check_tool(tool, "containers.tools")?;
        }

        let mut labels = HashSet::new();
        for target in &self.setup.targets {
            if !labels.insert(target.label.as_str()) {
                return Err(Error::configuration(format!(
                    "Duplicate setup target label '{}'",
                    target.label
                )));
            }
            for tool in &target.tools {
                if tool.version == ToolVersion::Matched {
                    return Err(Error::configuration(format!(
                        "Setup tool '{}' in target '{}' cannot use the matched version",
                        tool.name, target.label
                    )));
                }
                self.check_tool(tool, "setup.targets")?;
            }
        }

        Ok(())
    }

    fn check_tool(&self, tool: &ToolTemplate, section: &str) -> Result<()> {
        if tool.verify.is_empty() {
            return Err(Error::configuration(format!(
                "Tool '{}' in {section} needs a verify command",
                tool.name
            )));
        }
        if let Some(repository) = tool.latest_repository() {
            self.require_repository(repository, section)?;
        }
        Ok(())
    }

    fn require_repository(&self, name: &str, section: &str) -> Result<()> {
        if self.containers.repositories.contains_key(name) {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "{section} references unknown repository '{name}'"
            )))
        }
    }
}

/// Retry policy for artifact downloads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts before giving up, including the first
    pub max_attempts: usize,
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Upper bound on a single delay
    pub max_backoff_ms: u64,
    /// Growth factor between delays
    pub backoff_multiplier: f64,
    /// TCP connect timeout
    pub connect_timeout_secs: u64,
    /// Accept invalid TLS certificates
    pub accept_invalid_certs: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            connect_timeout_secs: 30,
            accept_invalid_certs: false,
        }
    }
}

/// Matched-version toolchain images.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainersConfig {
    /// Base image for every toolchain
    pub base_image: String,
    /// Number of highest matched versions to build
    pub fanout: usize,
    /// Target operating system substituted for `{os}`
    pub os: String,
    /// Target architecture substituted for `{arch}`
    pub arch: String,
    /// Named upstream repositories
    pub repositories: BTreeMap<String, RepositoryRef>,
    /// Repositories whose tags are intersected
    #[serde(rename = "match")]
    pub match_repositories: Vec<String>,
    /// Tools installed into every toolchain, in order
    pub tools: Vec<ToolTemplate>,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        let repositories = BTreeMap::from([
            (
                "kubernetes".to_string(),
                RepositoryRef::new("https://github.com/kubernetes/kubernetes.git", "master"),
            ),
            (
                "openshift".to_string(),
                RepositoryRef::new("https://github.com/openshift/kubernetes.git", "master"),
            ),
            (
                "helm".to_string(),
                RepositoryRef::new("https://github.com/helm/helm.git", "main"),
            ),
        ]);

        Self {
            base_image: "docker.io/alpine:3.17.3".to_string(),
            fanout: 5,
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            repositories,
            match_repositories: vec!["kubernetes".to_string(), "openshift".to_string()],
            tools: vec![
                ToolTemplate::new(
                    "kubectl",
                    "https://dl.k8s.io/release/{version}/bin/{os}/{arch}/kubectl",
                    ToolVersion::Matched,
                    ["kubectl", "version", "--client"],
                ),
                ToolTemplate::new(
                    "kustomize",
                    "https://github.com/kubernetes-sigs/kustomize/releases/download/kustomize%2F{version}/kustomize_{version}_{os}_{arch}.tar.gz",
                    ToolVersion::Pinned {
                        version: "v5.0.1".to_string(),
                    },
                    ["kustomize", "version"],
                ),
                ToolTemplate::new(
                    "helm",
                    "https://get.helm.sh/helm-{version}-{os}-{arch}.tar.gz",
                    ToolVersion::Latest {
                        repository: "helm".to_string(),
                    },
                    ["helm", "version", "--client"],
                )
                .with_strip_components(1),
            ],
        }
    }
}

/// Standalone tool images.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetupConfig {
    /// Images to build, in parallel
    pub targets: Vec<SetupTarget>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        let terraform = ToolTemplate::new(
            "terraform",
            "https://releases.hashicorp.com/terraform/{version}/terraform_{version}_{os}_{arch}.zip",
            ToolVersion::Pinned {
                version: "1.6.0".to_string(),
            },
            ["terraform", "version"],
        )
        .with_env(EnvSetting::literal("TF_IN_AUTOMATION", "1"));

        let go = ToolTemplate::new(
            "go",
            "https://go.dev/dl/go{version}.{os}-{arch}.tar.gz",
            ToolVersion::Pinned {
                version: "1.21.3".to_string(),
            },
            ["go", "version"],
        )
        .with_install_dir("/usr/local")
        .with_env(EnvSetting::expanded("PATH", "/usr/local/go/bin:$PATH"));

        Self {
            targets: vec![
                SetupTarget::new("terraform-alpine", "alpine:latest", vec![terraform.clone()]),
                SetupTarget::new("terraform-ubuntu", "ubuntu:latest", vec![terraform]),
                SetupTarget::new("go-alpine", "alpine:latest", vec![go]),
            ],
        }
    }
}

fn default_os() -> String {
    "linux".to_string()
}

fn default_arch() -> String {
    "amd64".to_string()
}

/// One standalone image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupTarget {
    /// Unique label used in logs and errors
    pub label: String,
    /// Base image reference
    pub base_image: String,
    /// Target operating system
    #[serde(default = "default_os")]
    pub os: String,
    /// Target architecture
    #[serde(default = "default_arch")]
    pub arch: String,
    /// Tools installed in order
    #[serde(default)]
    pub tools: Vec<ToolTemplate>,
}

impl SetupTarget {
    /// A linux/amd64 target.
    #[must_use]
    pub fn new(label: impl Into<String>, base_image: impl Into<String>, tools: Vec<ToolTemplate>) -> Self {
        Self {
            label: label.into(),
            base_image: base_image.into(),
            os: default_os(),
            arch: default_arch(),
            tools,
        }
    }
}

/// Hosting platform semantic-release publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePlatform {
    /// GitHub
    #[default]
    Github,
    /// GitLab
    Gitlab,
    /// Bitbucket
    Bitbucket,
}

impl ReleasePlatform {
    /// Environment variable holding the platform token.
    #[must_use]
    pub fn token_env(self) -> &'static str {
        match self {
            Self::Github => "GITHUB_TOKEN",
            Self::Gitlab => "GITLAB_TOKEN",
            Self::Bitbucket => "BITBUCKET_TOKEN",
        }
    }

    /// The semantic-release plugin for this platform.
    #[must_use]
    pub fn plugin_package(self) -> &'static str {
        match self {
            Self::Github => "@semantic-release/github@latest",
            Self::Gitlab => "@semantic-release/gitlab@latest",
            Self::Bitbucket => "@semantic-release/bitbucket@latest",
        }
    }
}

impl fmt::Display for ReleasePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Github => write!(f, "github"),
            Self::Gitlab => write!(f, "gitlab"),
            Self::Bitbucket => write!(f, "bitbucket"),
        }
    }
}

/// semantic-release run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReleaseConfig {
    /// Node image running semantic-release
    pub image: String,
    /// Publishing platform
    pub platform: ReleasePlatform,
    /// Repository to release, mounted at `/WORK/repo`
    pub repository_dir: PathBuf,
    /// npm package specs installed globally, before the platform plugin
    pub packages: Vec<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            image: "docker.io/node:20.5.1-alpine3.18".to_string(),
            platform: ReleasePlatform::Github,
            repository_dir: PathBuf::from(".."),
            packages: [
                "semantic-release@latest",
                "@semantic-release/release-notes-generator@latest",
                "@semantic-release/npm@latest",
                "@semantic-release/exec@latest",
                "@semantic-release/changelog@latest",
                "@semantic-release/git@latest",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}
