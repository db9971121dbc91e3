//! The kubetools pipelines and the services they share.

mod containers;
mod release;
mod setup;

pub use containers::run_containers;
pub use release::{ReleaseEnv, release_command, release_image, run_release};
pub use setup::run_setup;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assembler::ToolchainAssembler;
use crate::config::Config;
use crate::download::ArtifactSource;
use crate::engine::{ContainerEngine, Image};
use crate::error::{Error, Result};
use crate::installer::BinaryInstaller;
use crate::orchestrator::{TaskGroup, TaskReport};
use crate::plan::{BuildOutcome, ToolchainBuildPlan};
use crate::tags::{TagFetcher, VersionControl};

/// Configuration plus the collaborators every pipeline needs.
#[derive(Clone)]
pub struct PipelineContext {
    config: Arc<Config>,
    fetcher: Arc<TagFetcher>,
    assembler: ToolchainAssembler,
    engine: Arc<dyn ContainerEngine>,
}

impl PipelineContext {
    /// Wire the pipelines to their providers.
    pub fn new(
        config: Config,
        vcs: Arc<dyn VersionControl>,
        engine: Arc<dyn ContainerEngine>,
        source: Arc<dyn ArtifactSource>,
    ) -> Self {
        let fetcher = TagFetcher::new(vcs, config.repositories_dir());
        let installer = BinaryInstaller::new(Arc::clone(&engine), source);
        Self {
            config: Arc::new(config),
            fetcher: Arc::new(fetcher),
            assembler: ToolchainAssembler::new(installer),
            engine,
        }
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared tag fetcher.
    #[must_use]
    pub fn fetcher(&self) -> &Arc<TagFetcher> {
        &self.fetcher
    }

    /// The container engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Fetch the latest tag of each named repository concurrently.
    async fn fetch_latest_tags(
        &self,
        names: BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>> {
        let mut group = TaskGroup::new(cancel);
        for name in &names {
            let repo = self.repository(name)?;
            let fetcher = Arc::clone(&self.fetcher);
            group.spawn(format!("latest {name}"), move |token| async move {
                fetcher.fetch_latest_tag(&repo, &token).await
            });
        }

        let latest = group.join().await.into_result()?;
        Ok(names.into_iter().zip(latest).collect())
    }

    fn repository(&self, name: &str) -> Result<crate::tags::RepositoryRef> {
        self.config
            .containers
            .repositories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("Unknown repository '{name}'")))
    }

    /// Assemble every plan concurrently and record one outcome per plan.
    async fn assemble_all(
        &self,
        pipeline: &str,
        plans: Vec<ToolchainBuildPlan>,
        cancel: &CancellationToken,
    ) -> Result<Vec<BuildOutcome>> {
        let mut group = TaskGroup::new(cancel);
        for plan in plans {
            let assembler = self.assembler.clone();
            group.spawn(plan.label.clone(), move |token| async move {
                assembler.assemble(&plan, &token).await
            });
        }
        collect_outcomes(pipeline, group.join().await)
    }
}

fn collect_outcomes(pipeline: &str, report: TaskReport<Image>) -> Result<Vec<BuildOutcome>> {
    let outcomes: Vec<BuildOutcome> = report
        .names()
        .iter()
        .zip(report.results())
        .map(|(label, result)| match result {
            Ok(_) => BuildOutcome::success(label),
            Err(e) => BuildOutcome::failure(label, e),
        })
        .collect();

    for outcome in &outcomes {
        if outcome.is_success() {
            info!(%pipeline, plan = outcome.label(), "Toolchain built");
        } else {
            warn!(%pipeline, outcome = %outcome, "Toolchain failed");
        }
    }

    report.into_result()?;
    Ok(outcomes)
}
