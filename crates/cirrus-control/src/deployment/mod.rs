//! Deployment orchestration and rollback.
//!
//! Both operations share the [`ArtifactPipeline`]: extract the archive into
//! an ephemeral workspace, synthesize the entrypoint, store the source and
//! build the image. Only version reservation and activation touch the
//! metadata store's per-function lock.

mod orchestrator;
mod pipeline;
mod rollback;

pub use orchestrator::{DeployOutcome, DeployRequest, DeploymentOrchestrator};
pub use pipeline::{ArtifactPipeline, Upload};
pub use rollback::{RollbackOutcome, RollbackPath, RollbackRequest, RollbackResolver};
