//! Rollback to a previous version.

use std::sync::Arc;

use cirrus_build::DeployStage;
use serde::Serialize;
use tracing::{info, instrument};

use super::orchestrator::owned_function;
use super::pipeline::{ArtifactPipeline, Upload};
use crate::error::{ControlError, ControlResult};
use crate::store::MetadataStore;
use crate::types::{DeploymentId, FunctionId, OwnerId};

/// Request to make a previous version active again.
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    /// Caller; must own the function.
    pub owner_id: OwnerId,
    /// Function to roll back.
    pub function_id: FunctionId,
    /// Version to reactivate.
    pub version: u32,
}

/// How the artifact for a rollback target was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPath {
    /// The image was still present (or the target was already active).
    Fast,
    /// The image was rebuilt from the stored source archive.
    Slow,
}

/// Result of a successful rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    /// Deployment that is now active.
    pub deployment_id: DeploymentId,
    /// Version that is now active.
    pub version: u32,
    /// Whether a rebuild was needed.
    pub path: RollbackPath,
}

/// Reactivates earlier versions, rebuilding their image when it is gone.
pub struct RollbackResolver {
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<ArtifactPipeline>,
}

impl RollbackResolver {
    /// Create a new resolver.
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, pipeline: Arc<ArtifactPipeline>) -> Self {
        Self { store, pipeline }
    }

    /// Roll a function back to `request.version`.
    ///
    /// The artifact is confirmed (or rebuilt) before any metadata changes;
    /// any failure leaves the current active deployment in place.
    #[instrument(skip(self, request), fields(function_id = %request.function_id, version = request.version))]
    pub async fn rollback(&self, request: RollbackRequest) -> ControlResult<RollbackOutcome> {
        let function = owned_function(self.store.as_ref(), &request.owner_id, &request.function_id).await?;

        let target = self
            .store
            .get_deployment_by_version(&function.id, request.version)
            .await?
            .ok_or_else(|| {
                ControlError::not_found(format!(
                    "version {} of function {}",
                    request.version, function.id
                ))
            })?;

        if !target.status.is_rollback_target() {
            return Err(ControlError::validation(format!(
                "version {} is {} and cannot be rolled back to",
                target.version, target.status
            )));
        }

        if target.is_active {
            info!("target version is already active");
            return Ok(RollbackOutcome {
                deployment_id: target.id,
                version: target.version,
                path: RollbackPath::Fast,
            });
        }

        let builder = self.pipeline.builder();
        let image_present = builder
            .image_exists(&target.image_tag)
            .await
            .map_err(|e| ControlError::deploy(DeployStage::Build, e))?;

        let path = if image_present {
            RollbackPath::Fast
        } else {
            let archives = self.pipeline.archives();
            if !archives.exists(&target.archive_key).await? {
                return Err(ControlError::ArchiveMissing {
                    function_id: function.id.to_string(),
                    version: target.version,
                });
            }

            info!(key = %target.archive_key, "image missing, rebuilding from stored source");
            let archive = archives
                .get(&target.archive_key)
                .await
                .map_err(|e| ControlError::deploy(DeployStage::Extraction, e))?;
            self.pipeline
                .run(archive, &target.image_tag, Upload::Skip)
                .await?;
            RollbackPath::Slow
        };

        let activated = self.store.activate(&function.id, &target.id).await?;

        info!(
            deployment_id = %activated.id,
            path = ?path,
            "rollback completed"
        );

        Ok(RollbackOutcome {
            deployment_id: activated.id,
            version: activated.version,
            path,
        })
    }
}

impl std::fmt::Debug for RollbackResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackResolver").finish_non_exhaustive()
    }
}
