//! Dagger engine for kubetools
//!
//! Replays a declarative [`Image`] against a Dagger session and runs one
//! command on top of it.

use async_trait::async_trait;
use dagger_sdk::{
    Config, Container, ContainerWithEnvVariableOpts, ContainerWithExecOpts, ContainerWithExecOptsBuilder, Query,
    ReturnType, connect_opts,
};
use kubetools_core::{BuildStep, ContainerEngine, Error, ExecOutput, Image, Result};
use secrecy::ExposeSecret;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

type DaggerReport = Box<dyn std::error::Error + Send + Sync + 'static>;
type ResultStore = Arc<Mutex<Option<std::result::Result<ExecOutput, DaggerReport>>>>;

const ENGINE: &str = "dagger";

/// Container engine backed by the Dagger SDK.
///
/// Each [`ContainerEngine::run`] opens its own session; Dagger's layer cache
/// makes replaying a shared prefix of steps cheap.
#[derive(Debug, Default, Clone)]
pub struct DaggerEngine;

impl DaggerEngine {
    /// Create an engine using the default Dagger connection settings.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContainerEngine for DaggerEngine {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn run(&self, image: &Image, command: &[String]) -> Result<ExecOutput> {
        if command.is_empty() {
            return Err(Error::configuration("Container command must not be empty"));
        }

        let image = image.clone();
        let command = command.to_vec();
        let result_store: ResultStore = Arc::new(Mutex::new(None));
        let result_store_clone = Arc::clone(&result_store);

        debug!(base = image.base(), steps = image.steps().len(), ?command, "Running in dagger");

        connect_opts(Config::default(), move |client| async move {
            let res: std::result::Result<ExecOutput, DaggerReport> = match command_opts() {
                Ok(opts) => {
                    let container = replay(&client, &image).with_exec_opts(command, opts);

                    let stdout_res = container.stdout().await;
                    let stderr_res = container.stderr().await;
                    let exit_code_res = container.exit_code().await;

                    match (stdout_res, stderr_res, exit_code_res) {
                        (Ok(stdout), Ok(stderr), Ok(exit_code)) => Ok(exec_output(exit_code, stdout, stderr)),
                        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => Err(e.into()),
                    }
                }
                Err(e) => Err(e.into()),
            };

            if let Ok(mut guard) = result_store_clone.lock() {
                *guard = Some(res);
            }
            Ok(())
        })
        .await
        .map_err(|err| Error::engine(ENGINE, format!("session failed: {err}")))?;

        let mut guard = result_store
            .lock()
            .map_err(|_| Error::engine(ENGINE, "failed to acquire lock on command result"))?;
        let result = guard
            .take()
            .ok_or_else(|| Error::engine(ENGINE, "session ended without a command result"))?;

        result.map_err(|e: DaggerReport| Error::engine(ENGINE, e.to_string()))
    }
}

fn replay(client: &Query, image: &Image) -> Container {
    let mut container = client.container().from(image.base());

    for step in image.steps() {
        container = match step {
            BuildStep::Exec { args } => container.with_exec(args.clone()),
            BuildStep::Entrypoint { args } => container.with_entrypoint(args.clone()),
            BuildStep::Env { name, value, expand } => container.with_env_variable_opts(
                name,
                value,
                ContainerWithEnvVariableOpts {
                    expand: Some(*expand),
                },
            ),
            BuildStep::SecretEnv { name, value } => {
                let secret = client.set_secret(name, value.expose_secret());
                container.with_secret_variable(name, secret)
            }
            BuildStep::MountCache { path, volume } => container.with_mounted_cache(path, client.cache_volume(volume)),
            BuildStep::MountHostDirectory { host, path } => {
                container.with_mounted_directory(path, client.host().directory(host_path(host)))
            }
            BuildStep::CopyFile { host, path } => container.with_file(path, client.host().file(host_path(host))),
            BuildStep::CopyDirectory { host, path } => {
                container.with_directory(path, client.host().directory(host_path(host)))
            }
            BuildStep::Workdir { path } => container.with_workdir(path),
        };
    }

    container
}

/// Options for the final command: any exit status completes the exec, so a
/// failing command still reports its exit code and output.
fn command_opts() -> std::result::Result<ContainerWithExecOpts<'static>, String> {
    ContainerWithExecOptsBuilder::default()
        .expect(ReturnType::Any)
        .build()
        .map_err(|e| format!("invalid exec options: {e}"))
}

fn exec_output(exit_code: isize, stdout: String, stderr: String) -> ExecOutput {
    ExecOutput {
        exit_code: exit_code_to_i32(exit_code),
        stdout,
        stderr,
    }
}

fn host_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn exit_code_to_i32(code: isize) -> i32 {
    i32::try_from(code).unwrap_or(i32::MIN)
}
