//! Standalone tool images, one per configured target.

use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::PipelineContext;
use crate::error::Result;
use crate::plan::{BuildOutcome, TemplateContext, ToolchainBuildPlan};

/// Run the setup pipeline.
///
/// # Errors
///
/// Returns a tag fetch failure for `latest` tools or the first failed
/// target assembly.
#[instrument(name = "setup", skip_all)]
pub async fn run_setup(ctx: &PipelineContext, cancel: &CancellationToken) -> Result<Vec<BuildOutcome>> {
    let targets = &ctx.config().setup.targets;
    if targets.is_empty() {
        info!("No setup targets configured");
        return Ok(Vec::new());
    }

    let repositories: BTreeSet<String> = targets
        .iter()
        .flat_map(|target| &target.tools)
        .filter_map(|tool| tool.latest_repository())
        .map(str::to_string)
        .collect();
    let latest = ctx.fetch_latest_tags(repositories, cancel).await?;

    let plans = targets
        .iter()
        .map(|target| {
            let template_ctx = TemplateContext {
                os: &target.os,
                arch: &target.arch,
                matched: None,
                latest: &latest,
            };
            ToolchainBuildPlan::from_templates(&target.label, &target.base_image, &target.tools, &template_ctx)
        })
        .collect::<Result<Vec<_>>>()?;

    info!(targets = plans.len(), "Building setup images");
    ctx.assemble_all("setup", plans, cancel).await
}
