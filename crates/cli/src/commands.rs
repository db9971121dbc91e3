//! Command execution for the kubetools CLI.

use crate::cli::Selection;
use futures::FutureExt;
use futures::future::BoxFuture;
use kubetools_archive::{ArchiveJob, PackSummary, pack};
use kubetools_core::{
    BuildOutcome, Config, HttpDownloader, PipelineContext, Result, run_all, run_containers, run_release,
    run_setup,
};
use kubetools_dagger::DaggerEngine;
use kubetools_vcs::GitCli;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

type PipelineTask = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Wire the production providers: git, Dagger and the HTTP downloader.
pub fn context(config: Config) -> Result<PipelineContext> {
    let source = HttpDownloader::new(config.retry.clone(), config.downloads_dir())?;
    Ok(PipelineContext::new(
        config,
        Arc::new(GitCli::new()),
        Arc::new(DaggerEngine::new()),
        Arc::new(source),
    ))
}

fn built_images(outcomes: &[BuildOutcome]) -> Vec<&str> {
    outcomes.iter().map(BuildOutcome::label).collect()
}

/// Log the images a successful pipeline produced.
fn report(pipeline: &str, outcomes: &[BuildOutcome]) {
    info!(%pipeline, built = outcomes.len(), images = ?built_images(outcomes), "Pipeline succeeded");
}

fn tasks(selection: Selection, ctx: &PipelineContext) -> Vec<(String, PipelineTask)> {
    let mut tasks: Vec<(String, PipelineTask)> = Vec::new();

    if selection.containers {
        let ctx = ctx.clone();
        tasks.push((
            "containers".to_string(),
            Box::new(move |token| {
                async move {
                    let outcomes = run_containers(&ctx, &token).await?;
                    report("containers", &outcomes);
                    Ok(())
                }
                .boxed()
            }),
        ));
    }

    if selection.setup {
        let ctx = ctx.clone();
        tasks.push((
            "setup".to_string(),
            Box::new(move |token| {
                async move {
                    let outcomes = run_setup(&ctx, &token).await?;
                    report("setup", &outcomes);
                    Ok(())
                }
                .boxed()
            }),
        ));
    }

    if selection.release {
        let ctx = ctx.clone();
        tasks.push((
            "release".to_string(),
            Box::new(move |token| async move { run_release(&ctx, &token).await }.boxed()),
        ));
    }

    tasks
}

/// Run the selected pipelines concurrently; the first failure cancels the rest.
#[instrument(skip(ctx, cancel), fields(correlation_id = %crate::tracing::correlation_id()))]
pub async fn run_pipelines(selection: Selection, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<()> {
    run_all(cancel, tasks(selection, ctx)).await
}

/// Pack `pattern` into `destination` off the async runtime.
#[instrument]
pub async fn archive(pattern: String, destination: PathBuf) -> miette::Result<PackSummary> {
    let job = ArchiveJob::new(pattern, destination)?;
    let summary = tokio::task::spawn_blocking(move || pack(&job))
        .await
        .map_err(|e| miette::miette!("Archive task failed: {e}"))??;
    Ok(summary)
}
