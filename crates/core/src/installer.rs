//! Installs one binary artifact into an image and smoke-tests it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::download::ArtifactSource;
use crate::engine::{ContainerEngine, Image};
use crate::error::{Error, Result};
use crate::lock::KeyedLocks;
use crate::plan::{BinarySpec, InstallKind};
use crate::unpack::unpack;

/// Downloads, installs and verifies binaries.
#[derive(Clone)]
pub struct BinaryInstaller {
    engine: Arc<dyn ContainerEngine>,
    source: Arc<dyn ArtifactSource>,
    unpack_locks: KeyedLocks,
}

impl BinaryInstaller {
    /// Create an installer running verification through `engine`.
    pub fn new(engine: Arc<dyn ContainerEngine>, source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            engine,
            source,
            unpack_locks: KeyedLocks::new(),
        }
    }

    /// The engine running verification commands.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Install `spec` into `image` and run its verify command.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when `cancel` fired before the download or the
    /// verification, download and unpack errors as they occur, and
    /// `VerificationFailed` when the smoke test does not exit cleanly.
    pub async fn install(&self, image: Image, spec: &BinarySpec, cancel: &CancellationToken) -> Result<Image> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!(tool = %spec.name, url = %spec.download_url, kind = %spec.install_kind, "Installing binary");
        let artifact = self.source.fetch(&spec.download_url, cancel).await?;

        let mut image = match spec.install_kind {
            InstallKind::RawExecutable => {
                make_executable(&artifact).await?;
                let target = format!("{}/{}", spec.install_dir.trim_end_matches('/'), spec.file_name());
                image.with_file(target, artifact)
            }
            kind => {
                let unpacked = self.unpack_once(&artifact, kind, spec.strip_components).await?;
                image.with_directory(&spec.install_dir, unpacked)
            }
        };

        for env in &spec.env {
            image = if env.expand {
                image.with_expanded_env_variable(&env.name, &env.value)
            } else {
                image.with_env_variable(&env.name, &env.value)
            };
        }

        self.verify(&image, spec, cancel).await?;
        Ok(image)
    }

    async fn unpack_once(&self, artifact: &Path, kind: InstallKind, strip_components: usize) -> Result<PathBuf> {
        let file_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = artifact.with_file_name(format!("{file_name}.unpacked-{strip_components}"));

        let _guard = self.unpack_locks.lock(&dest.to_string_lossy()).await;
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(dest = %dest.display(), "Reusing unpacked artifact");
            return Ok(dest);
        }

        let archive = artifact.to_path_buf();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || unpack(&archive, kind, &target, strip_components))
            .await
            .map_err(|e| Error::TaskPanicked {
                name: format!("unpack {file_name}"),
                message: e.to_string(),
            })??;
        Ok(dest)
    }

    async fn verify(&self, image: &Image, spec: &BinarySpec, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!(tool = %spec.name, command = ?spec.verify, "Verifying binary");
        match self.engine.run(image, &spec.verify).await {
            Ok(output) if output.success() => {
                debug!(tool = %spec.name, stdout = %output.stdout.trim(), "Verified binary");
                Ok(())
            }
            Ok(output) => Err(Error::VerificationFailed {
                command: spec.verify.clone(),
                exit_code: Some(output.exit_code),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => Err(Error::VerificationFailed {
                command: spec.verify.clone(),
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            }),
        }
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BuildStep;
    use crate::plan::EnvSetting;
    use crate::test_utils::{FakeEngine, FakeSource, write_tar_gz};
    use tempfile::TempDir;

    const KUBECTL: &str = "https://dl.k8s.io/release/v1.27.3/bin/linux/amd64/kubectl";
    const HELM: &str = "https://get.helm.sh/helm-v3.12.0-linux-amd64.tar.gz";

    fn installer(engine: FakeEngine, source: FakeSource) -> (BinaryInstaller, Arc<FakeEngine>, Arc<FakeSource>) {
        let engine = Arc::new(engine);
        let source = Arc::new(source);
        (BinaryInstaller::new(engine.clone(), source.clone()), engine, source)
    }

    #[tokio::test]
    async fn test_raw_executable_is_copied_and_verified() {
        let temp = TempDir::new().unwrap();
        let (installer, engine, _) = installer(FakeEngine::new(), FakeSource::new(temp.path()));
        let spec = BinarySpec::new("kubectl", KUBECTL, ["kubectl", "version", "--client"]).unwrap();

        let image = installer
            .install(Image::new("alpine"), &spec, &CancellationToken::new())
            .await
            .unwrap();

        match &image.steps()[0] {
            BuildStep::CopyFile { host, path } => {
                assert_eq!(path, "/usr/local/bin/kubectl");
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = std::fs::metadata(host).unwrap().permissions().mode();
                    assert_eq!(mode & 0o777, 0o755);
                }
                #[cfg(not(unix))]
                let _ = host;
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(engine.commands(), vec![vec!["kubectl", "version", "--client"]]);
    }

    #[tokio::test]
    async fn test_archive_is_unpacked_and_merged() {
        let temp = TempDir::new().unwrap();
        let tarball = temp.path().join("helm.tar.gz");
        write_tar_gz(&tarball, &[("linux-amd64/helm", b"helm"), ("linux-amd64/README.md", b"docs")]);
        let source = FakeSource::new(temp.path()).with_artifact(HELM, tarball);
        let (installer, _, _) = installer(FakeEngine::new(), source);
        let spec = BinarySpec::new("helm", HELM, ["helm", "version"])
            .unwrap()
            .with_strip_components(1);

        let image = installer
            .install(Image::new("alpine"), &spec, &CancellationToken::new())
            .await
            .unwrap();

        match &image.steps()[0] {
            BuildStep::CopyDirectory { host, path } => {
                assert_eq!(path, "/usr/local/bin");
                assert!(host.join("helm").is_file());
                assert!(host.join("README.md").is_file());
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_env_applied_before_verification() {
        let temp = TempDir::new().unwrap();
        let tarball = temp.path().join("go.tar.gz");
        write_tar_gz(&tarball, &[("go/bin/go", b"go")]);
        let url = "https://go.dev/dl/go1.21.3.linux-amd64.tar.gz";
        let source = FakeSource::new(temp.path()).with_artifact(url, tarball);
        let (installer, engine, _) = installer(FakeEngine::new(), source);
        let spec = BinarySpec::new("go", url, ["go", "version"])
            .unwrap()
            .with_install_dir("/usr/local")
            .with_env(EnvSetting::expanded("PATH", "/usr/local/go/bin:$PATH"));

        installer
            .install(Image::new("alpine"), &spec, &CancellationToken::new())
            .await
            .unwrap();

        let verified = &engine.images()[0];
        assert!(verified.steps().iter().any(|step| matches!(
            step,
            BuildStep::Env { name, expand: true, .. } if name == "PATH"
        )));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_verification_failure() {
        let temp = TempDir::new().unwrap();
        let (installer, _, _) = installer(
            FakeEngine::new().with_exit_code("kubectl", 127),
            FakeSource::new(temp.path()),
        );
        let spec = BinarySpec::new("kubectl", KUBECTL, ["kubectl", "version"]).unwrap();

        let err = installer
            .install(Image::new("alpine"), &spec, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::VerificationFailed {
                command,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(command, ["kubectl", "version"]);
                assert_eq!(exit_code, Some(127));
                assert!(stderr.contains("failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_engine_error_is_verification_failure() {
        let temp = TempDir::new().unwrap();
        let (installer, _, _) = installer(
            FakeEngine::new().with_engine_error("kubectl"),
            FakeSource::new(temp.path()),
        );
        let spec = BinarySpec::new("kubectl", KUBECTL, ["kubectl"]).unwrap();

        let err = installer
            .install(Image::new("alpine"), &spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VerificationFailed { exit_code: None, .. }));
    }

    #[tokio::test]
    async fn test_download_failure_propagates() {
        let temp = TempDir::new().unwrap();
        let (installer, engine, _) = installer(FakeEngine::new(), FakeSource::new(temp.path()).with_missing(KUBECTL));
        let spec = BinarySpec::new("kubectl", KUBECTL, ["kubectl"]).unwrap();

        let err = installer
            .install(Image::new("alpine"), &spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Download { .. }));
        assert!(engine.commands().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_install_does_not_download() {
        let temp = TempDir::new().unwrap();
        let (installer, _, source) = installer(FakeEngine::new(), FakeSource::new(temp.path()));
        let spec = BinarySpec::new("kubectl", KUBECTL, ["kubectl"]).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = installer.install(Image::new("alpine"), &spec, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(source.fetched().is_empty());
    }
}
