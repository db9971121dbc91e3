//! Builds one verified toolchain image from a plan.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::engine::Image;
use crate::error::{Error, Result};
use crate::installer::BinaryInstaller;
use crate::plan::ToolchainBuildPlan;

/// Applies a plan's binaries in order on top of its base image.
#[derive(Clone)]
pub struct ToolchainAssembler {
    installer: BinaryInstaller,
}

impl ToolchainAssembler {
    /// Create an assembler.
    #[must_use]
    pub fn new(installer: BinaryInstaller) -> Self {
        Self { installer }
    }

    /// Assemble `plan`, stopping at the first failing step.
    ///
    /// # Errors
    ///
    /// Returns `AssemblyFailed` naming the plan, the 1-based step and the tool.
    #[instrument(name = "assemble", skip_all, fields(plan = %plan.label))]
    pub async fn assemble(&self, plan: &ToolchainBuildPlan, cancel: &CancellationToken) -> Result<Image> {
        info!(base = %plan.base_image, steps = plan.steps.len(), "Assembling toolchain");

        let mut image = Image::new(&plan.base_image).with_entrypoint(Vec::<String>::new());
        for (index, spec) in plan.steps.iter().enumerate() {
            image = self
                .installer
                .install(image, spec, cancel)
                .await
                .map_err(|e| Error::assembly_failed(&plan.label, index + 1, &spec.name, e))?;
        }

        info!("Toolchain verified");
        Ok(image)
    }
}
