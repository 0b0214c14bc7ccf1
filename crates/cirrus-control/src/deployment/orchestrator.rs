//! Deploy orchestration.

use std::sync::Arc;

use bytes::Bytes;
use cirrus_build::DeployStage;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::pipeline::{ArtifactPipeline, Upload};
use crate::error::{ControlError, ControlResult};
use crate::store::MetadataStore;
use crate::types::{DeploymentId, DeploymentRecord, FunctionId, FunctionRecord, FunctionStatus, OwnerId};

/// Request to deploy a new version of a function.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Caller; must own the function.
    pub owner_id: OwnerId,
    /// Function to deploy.
    pub function_id: FunctionId,
    /// Source archive (tar, tar.gz or tar.zst).
    pub archive: Bytes,
}

/// Result of a successful deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployOutcome {
    /// Version number assigned to this deploy.
    pub version: u32,
    /// Deployment that is now active.
    pub deployment_id: DeploymentId,
    /// Whether the function had never been deployed before.
    pub was_first_deployment: bool,
}

/// Runs the deploy pipeline and keeps the version registry consistent.
pub struct DeploymentOrchestrator {
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<ArtifactPipeline>,
    max_archive_bytes: usize,
}

impl DeploymentOrchestrator {
    /// Create a new orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        pipeline: Arc<ArtifactPipeline>,
        max_archive_bytes: usize,
    ) -> Self {
        Self {
            store,
            pipeline,
            max_archive_bytes,
        }
    }

    /// Deploy a new version of a function.
    ///
    /// 1. Reserve the next version as a `building` deployment
    /// 2. Extract and synthesize in a fresh workspace
    /// 3. Store the synthesized source
    /// 4. Build the image
    /// 5. Activate the new deployment, disabling the previous one
    ///
    /// On failure the reserved deployment and the function are marked
    /// `failed` and the previously active deployment keeps serving.
    #[instrument(skip(self, request), fields(function_id = %request.function_id))]
    pub async fn deploy(&self, request: DeployRequest) -> ControlResult<DeployOutcome> {
        if request.archive.is_empty() {
            return Err(ControlError::validation("archive is empty"));
        }
        if request.archive.len() > self.max_archive_bytes {
            return Err(ControlError::validation(format!(
                "archive of {} bytes exceeds limit of {} bytes",
                request.archive.len(),
                self.max_archive_bytes
            )));
        }

        let function = owned_function(self.store.as_ref(), &request.owner_id, &request.function_id).await?;
        let was_first_deployment = function.status == FunctionStatus::Init;

        let reserved = self.store.reserve_deployment(&function.id).await?;
        info!(
            version = reserved.version,
            deployment_id = %reserved.id,
            first = was_first_deployment,
            "starting deployment"
        );

        let built = self
            .pipeline
            .run(
                request.archive,
                &reserved.image_tag,
                Upload::To(&reserved.archive_key),
            )
            .await;

        if let Err(e) = built {
            self.handle_failure(&reserved, &e).await;
            return Err(e);
        }

        let activated = match self.store.activate(&function.id, &reserved.id).await {
            Ok(activated) => activated,
            Err(e) => {
                self.handle_failure(&reserved, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.pipeline.builder().prune_dangling().await {
            warn!(error = %e, "failed to prune dangling images");
        }

        info!(
            version = activated.version,
            deployment_id = %activated.id,
            "deployment completed successfully"
        );

        Ok(DeployOutcome {
            version: activated.version,
            deployment_id: activated.id,
            was_first_deployment,
        })
    }

    async fn handle_failure(&self, reserved: &DeploymentRecord, err: &ControlError) {
        error!(
            version = reserved.version,
            deployment_id = %reserved.id,
            kind = err.kind(),
            error = %err,
            "deployment failed"
        );

        if let Err(e) = self
            .store
            .fail_deployment(&reserved.id, &err.to_string())
            .await
        {
            warn!(deployment_id = %reserved.id, error = %e, "failed to mark deployment as failed");
        }

        if matches!(err, ControlError::Deploy { stage: DeployStage::Build, .. }) {
            if let Err(e) = self.pipeline.builder().remove_image(&reserved.image_tag).await {
                warn!(tag = %reserved.image_tag, error = %e, "failed to remove partial image");
            }
        }
    }
}

/// Look up a function the caller owns.
///
/// A function owned by someone else is reported as missing.
pub(crate) async fn owned_function(
    store: &dyn MetadataStore,
    owner_id: &OwnerId,
    function_id: &FunctionId,
) -> ControlResult<FunctionRecord> {
    match store.get_function(function_id).await? {
        Some(function) if &function.owner_id == owner_id => Ok(function),
        _ => Err(ControlError::not_found(format!("function {function_id}"))),
    }
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("max_archive_bytes", &self.max_archive_bytes)
            .finish_non_exhaustive()
    }
}
