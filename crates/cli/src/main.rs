//! kubetools command-line entry point.

mod cli;
mod commands;
mod tracing;

use crate::cli::{Commands, parse};
use crate::tracing::{TracingConfig, init_tracing};
use ::tracing::{info, warn};
use kubetools_core::Config;
use tokio_util::sync::CancellationToken;

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("{error:?}");
        std::process::exit(1);
    }
}

async fn run() -> miette::Result<()> {
    let cli = parse();

    init_tracing(TracingConfig {
        format: cli.log_format,
        level: cli.level.into(),
        filter: None,
    })?;

    if let Some(Commands::Archive { pattern, destination }) = cli.command {
        let summary = commands::archive(pattern, destination).await?;
        info!(
            destination = %summary.destination.display(),
            entries = summary.entries,
            "Archive created"
        );
        return Ok(());
    }

    let selection = cli.selection();
    if selection.is_empty() {
        warn!("No pipeline selected; pass --containers, --setup, --release or --all");
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    let ctx = commands::context(config)?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    commands::run_pipelines(selection, &ctx, &cancel).await?;
    info!("All selected pipelines succeeded");
    Ok(())
}

/// Cancel `token` on Ctrl-C so running tasks stop at their next checkpoint.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, cancelling pipelines");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to install Ctrl-C handler"),
        }
    });
}
