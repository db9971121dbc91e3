//! Core engine for kubetools.
//!
//! kubetools keeps CI toolchain images in step with upstream releases. It
//! reads the release tags of several upstream repositories, keeps the
//! versions they all publish, and assembles one verified container image per
//! selected version.
//!
//! # Architecture
//!
//! ```text
//! TagFetcher ──► intersect ──► select_latest ──► ToolchainBuildPlan
//!                                                       │
//!                      TaskGroup (fail-fast fan-out) ◄──┘
//!                                │
//!          ToolchainAssembler ──► BinaryInstaller ──► ContainerEngine
//!                                       │
//!                                ArtifactSource + unpack
//! ```
//!
//! Providers sit behind traits: [`VersionControl`] for tag listing,
//! [`ArtifactSource`] for downloads and [`ContainerEngine`] for running
//! images. The `kubetools-vcs` and `kubetools-dagger` crates supply the
//! production implementations.

pub mod assembler;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod installer;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod retry;
pub mod tags;
pub mod unpack;
pub mod version;

#[cfg(test)]
mod test_utils;

pub use assembler::ToolchainAssembler;
pub use config::{Config, ContainersConfig, ReleaseConfig, ReleasePlatform, RetryConfig, SetupConfig, SetupTarget};
pub use download::{ArtifactSource, HttpDownloader};
pub use engine::{BuildStep, ContainerEngine, ExecOutput, Image};
pub use error::{Error, Result};
pub use installer::BinaryInstaller;
pub use orchestrator::{TaskGroup, TaskReport, run_all};
pub use pipeline::{PipelineContext, run_containers, run_release, run_setup};
pub use plan::{BinarySpec, BuildOutcome, InstallKind, ToolTemplate, ToolVersion, ToolchainBuildPlan};
pub use tags::{MatchedVersions, RepositoryRef, TagFetcher, TagSet, VersionControl, intersect};
pub use version::{Version, compare_tags};
