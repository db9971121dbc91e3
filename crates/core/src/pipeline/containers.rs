//! Matched-version toolchain images.
//!
//! Fetches the tags of every compared repository in parallel, intersects
//! them, and assembles one verified toolchain per selected version.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::PipelineContext;
use crate::error::Result;
use crate::orchestrator::TaskGroup;
use crate::plan::{BuildOutcome, TemplateContext, ToolchainBuildPlan};
use crate::tags::{TagSet, intersect};

enum Fetched {
    Tags(TagSet),
    Latest { repository: String, tag: String },
}

/// Run the containers pipeline.
///
/// # Errors
///
/// Returns the first fetch failure, `NoMatchingVersions` when the compared
/// repositories share no release, or the first failed assembly.
#[instrument(name = "containers", skip_all)]
pub async fn run_containers(ctx: &PipelineContext, cancel: &CancellationToken) -> Result<Vec<BuildOutcome>> {
    let config = &ctx.config().containers;

    let mut group = TaskGroup::new(cancel);
    for name in &config.match_repositories {
        let repo = ctx.repository(name)?;
        let fetcher = Arc::clone(ctx.fetcher());
        group.spawn(format!("tags {name}"), move |token| async move {
            fetcher.fetch_tags(&repo, &token).await.map(Fetched::Tags)
        });
    }
    for tool in &config.tools {
        let Some(name) = tool.latest_repository() else {
            continue;
        };
        let repo = ctx.repository(name)?;
        let fetcher = Arc::clone(ctx.fetcher());
        let repository = name.to_string();
        group.spawn(format!("latest {name}"), move |token| async move {
            let tag = fetcher.fetch_latest_tag(&repo, &token).await?;
            Ok(Fetched::Latest { repository, tag })
        });
    }

    let mut tag_sets = Vec::new();
    let mut latest = HashMap::new();
    for fetched in group.join().await.into_result()? {
        match fetched {
            Fetched::Tags(tags) => tag_sets.push(tags),
            Fetched::Latest { repository, tag } => {
                latest.insert(repository, tag);
            }
        }
    }

    let matched = intersect(&tag_sets);
    info!(
        repositories = ?matched.repositories(),
        count = matched.len(),
        "Matched upstream tags"
    );
    let selected = matched.select_latest(config.fanout)?;
    info!(versions = ?selected, "Selected versions");

    let plans = selected
        .iter()
        .map(|version| {
            let template_ctx = TemplateContext {
                os: &config.os,
                arch: &config.arch,
                matched: Some(version),
                latest: &latest,
            };
            ToolchainBuildPlan::from_templates(version, &config.base_image, &config.tools, &template_ctx)
        })
        .collect::<Result<Vec<_>>>()?;

    ctx.assemble_all("containers", plans, cancel).await
}
