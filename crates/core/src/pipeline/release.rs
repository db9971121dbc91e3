//! semantic-release run inside a Node image.

use secrecy::SecretString;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::PipelineContext;
use crate::config::ReleaseConfig;
use crate::engine::Image;
use crate::error::{Error, Result};

const REPO_MOUNT: &str = "/WORK/repo";
const CI_PREFIX: &str = "CI";

/// Host environment the release pipeline reads.
#[derive(Debug, Clone, Default)]
pub struct ReleaseEnv {
    /// Platform token, when set
    pub token: Option<String>,
    /// Host variables considered for forwarding
    pub vars: Vec<(String, String)>,
}

impl ReleaseEnv {
    /// Snapshot the current process environment.
    #[must_use]
    pub fn from_host(token_env: &str) -> Self {
        Self {
            token: std::env::var(token_env).ok(),
            vars: std::env::vars().collect(),
        }
    }

    /// Whether `CI` is set to a non-empty value.
    #[must_use]
    pub fn is_ci(&self) -> bool {
        self.vars.iter().any(|(name, value)| name == "CI" && !value.is_empty())
    }
}

/// The semantic-release invocation.
///
/// Outside CI semantic-release defaults to a dry run.
#[must_use]
pub fn release_command(ci: bool) -> Vec<String> {
    let mut command = vec!["npx".to_string(), "semantic-release".to_string()];
    if ci {
        command.extend(["--dry-run=false".to_string(), "--debug".to_string()]);
    }
    command
}

/// The Node image with semantic-release installed and the repository mounted.
#[must_use]
pub fn release_image(
    config: &ReleaseConfig,
    token: Arc<SecretString>,
    repo_dir: &Path,
    vars: Vec<(String, String)>,
) -> Image {
    let mut image = Image::new(&config.image)
        .with_entrypoint(Vec::<String>::new())
        .with_mounted_cache("/var/cache/apk", "apk_cache")
        .with_exec(["apk", "update"])
        .with_exec(["apk", "add", "git", "git-lfs"]);

    for package in config
        .packages
        .iter()
        .map(String::as_str)
        .chain([config.platform.plugin_package()])
    {
        image = image.with_exec(["npm", "install", "-g", package]);
    }

    image
        .with_mounted_directory(REPO_MOUNT, repo_dir)
        .with_secret_variable(config.platform.token_env(), token)
        .with_env_matching_prefix(vars, CI_PREFIX, &[])
        .with_workdir(REPO_MOUNT)
}

/// Run semantic-release against the configured repository.
///
/// # Errors
///
/// Returns `Configuration` when the platform token is missing, `Io` when the
/// repository directory does not exist, and `CommandFailed` when
/// semantic-release exits non-zero.
pub async fn run_release(ctx: &PipelineContext, cancel: &CancellationToken) -> Result<()> {
    let env = ReleaseEnv::from_host(ctx.config().release.platform.token_env());
    run_release_with(ctx, env, cancel).await
}

#[instrument(name = "release", skip_all, fields(platform = %ctx.config().release.platform))]
pub(crate) async fn run_release_with(ctx: &PipelineContext, env: ReleaseEnv, cancel: &CancellationToken) -> Result<()> {
    let config = &ctx.config().release;
    let token_env = config.platform.token_env();
    let token = env
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .map(|token| Arc::new(SecretString::from(token.to_string())))
        .ok_or_else(|| Error::configuration(format!("{token_env} must be set to publish a release")))?;

    let repo_dir = config
        .repository_dir
        .canonicalize()
        .map_err(|e| Error::io(&config.repository_dir, e))?;

    let ci = env.is_ci();
    let command = release_command(ci);
    let image = release_image(config, token, &repo_dir, env.vars);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    info!(repository = %repo_dir.display(), ci, "Running semantic-release");
    let output = ctx.engine().run(&image, &command).await?;
    if !output.success() {
        warn!(exit_code = output.exit_code, "semantic-release failed");
        return Err(Error::CommandFailed {
            command,
            exit_code: output.exit_code,
            stderr: output.stderr,
        });
    }

    info!("Release finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ReleasePlatform};
    use crate::engine::BuildStep;
    use crate::tags::{RepositoryRef, VersionControl};
    use crate::test_utils::{FakeEngine, FakeSource};
    use async_trait::async_trait;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    struct Offline;

    #[async_trait]
    impl VersionControl for Offline {
        fn name(&self) -> &'static str {
            "offline"
        }

        async fn sync(&self, repo: &RepositoryRef, _worktree: &Path) -> Result<()> {
            Err(Error::fetch(&repo.location, "offline"))
        }

        async fn list_tags(&self, _repo: &RepositoryRef, _worktree: &Path, _pattern: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn context(temp: &TempDir, platform: ReleasePlatform, engine: Arc<FakeEngine>) -> PipelineContext {
        let mut config = Config {
            cache_dir: temp.path().join("cache"),
            ..Config::default()
        };
        config.release.platform = platform;
        config.release.repository_dir = temp.path().to_path_buf();
        PipelineContext::new(config, Arc::new(Offline), engine, Arc::new(FakeSource::new(temp.path())))
    }

    fn env(token: Option<&str>, vars: &[(&str, &str)]) -> ReleaseEnv {
        ReleaseEnv {
            token: token.map(str::to_string),
            vars: vars
                .iter()
                .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_release_command() {
        assert_eq!(release_command(false), ["npx", "semantic-release"]);
        assert_eq!(
            release_command(true),
            ["npx", "semantic-release", "--dry-run=false", "--debug"]
        );
    }

    #[test]
    fn test_release_image_layout() {
        let config = ReleaseConfig {
            platform: ReleasePlatform::Gitlab,
            packages: vec!["semantic-release@latest".to_string()],
            ..ReleaseConfig::default()
        };
        let token = Arc::new(SecretString::from("glpat-123".to_string()));
        let vars = vec![
            ("CI".to_string(), "true".to_string()),
            ("CI_COMMIT_SHA".to_string(), "abc".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];

        let image = release_image(&config, token, Path::new("/src/project"), vars);
        assert_eq!(image.base(), "docker.io/node:20.5.1-alpine3.18");

        let execs: Vec<String> = image
            .steps()
            .iter()
            .filter_map(|step| match step {
                BuildStep::Exec { args } => Some(args.join(" ")),
                _ => None,
            })
            .collect();
        assert_eq!(
            execs,
            [
                "apk update",
                "apk add git git-lfs",
                "npm install -g semantic-release@latest",
                "npm install -g @semantic-release/gitlab@latest",
            ]
        );

        let steps = image.steps();
        assert!(matches!(&steps[0], BuildStep::Entrypoint { args } if args.is_empty()));
        assert!(matches!(
            &steps[1],
            BuildStep::MountCache { path, volume } if path == "/var/cache/apk" && volume == "apk_cache"
        ));
        assert!(steps.iter().any(|step| matches!(
            step,
            BuildStep::MountHostDirectory { host, path } if host == Path::new("/src/project") && path == "/WORK/repo"
        )));
        assert!(steps.iter().any(|step| matches!(
            step,
            BuildStep::SecretEnv { name, value } if name == "GITLAB_TOKEN" && value.expose_secret() == "glpat-123"
        )));

        let forwarded: Vec<&str> = steps
            .iter()
            .filter_map(|step| match step {
                BuildStep::Env { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(forwarded, ["CI", "CI_COMMIT_SHA"]);
        assert!(matches!(steps.last(), Some(BuildStep::Workdir { path }) if path == "/WORK/repo"));
    }

    #[tokio::test]
    async fn test_missing_token_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let ctx = context(&temp, ReleasePlatform::Github, engine.clone());

        for token in [None, Some("")] {
            let err = run_release_with(&ctx, env(token, &[]), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Configuration { .. }));
            assert!(err.to_string().contains("GITHUB_TOKEN"));
        }
        assert!(engine.commands().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_outside_ci() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let ctx = context(&temp, ReleasePlatform::Github, engine.clone());

        run_release_with(&ctx, env(Some("ghp_x"), &[]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(engine.commands(), [vec!["npx".to_string(), "semantic-release".to_string()]]);
    }

    #[tokio::test]
    async fn test_ci_publishes() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let ctx = context(&temp, ReleasePlatform::Bitbucket, engine.clone());

        run_release_with(&ctx, env(Some("token"), &[("CI", "1")]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.commands()[0], release_command(true));
        let image = &engine.images()[0];
        assert!(image.steps().iter().any(|step| matches!(
            step,
            BuildStep::SecretEnv { name, .. } if name == "BITBUCKET_TOKEN"
        )));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_command_failure() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new().with_exit_code("npx", 1));
        let ctx = context(&temp, ReleasePlatform::Github, engine);

        let err = run_release_with(&ctx, env(Some("token"), &[]), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { command, exit_code, stderr } => {
                assert_eq!(command, release_command(false));
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("npx failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_repository_dir() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let mut config = Config {
            cache_dir: temp.path().to_path_buf(),
            ..Config::default()
        };
        config.release.repository_dir = temp.path().join("missing");
        let ctx = PipelineContext::new(
            config,
            Arc::new(Offline),
            engine.clone(),
            Arc::new(FakeSource::new(temp.path())),
        );

        let err = run_release_with(&ctx, env(Some("token"), &[]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(engine.commands().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_run() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let ctx = context(&temp, ReleasePlatform::Github, engine.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_release_with(&ctx, env(Some("token"), &[]), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(engine.commands().is_empty());
    }
}
