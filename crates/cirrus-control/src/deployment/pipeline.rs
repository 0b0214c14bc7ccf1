//! The artifact pipeline shared by deploy and rollback.

use std::sync::Arc;

use bytes::Bytes;
use cirrus_build::{
    pack_directory, unpack, ArchiveStore, BuildService, DeployStage, ImageRef, Synthesis,
    Synthesizer, Workspace,
};
use tracing::{debug, info};

use crate::config::DeploymentConfig;
use crate::error::{ControlError, ControlResult};

/// Turns an uploaded archive into a tagged image.
///
/// Every step attributes its failure to a [`DeployStage`]. The workspace
/// lives only for the duration of one [`run`](Self::run) and is removed on
/// every exit path.
pub struct ArtifactPipeline {
    archives: ArchiveStore,
    builder: Arc<dyn BuildService>,
    synthesizer: Synthesizer,
    config: DeploymentConfig,
}

/// Where the synthesized source should be stored, if anywhere.
#[derive(Debug, Clone, Copy)]
pub enum Upload<'a> {
    /// Pack and store under this key before building.
    To(&'a str),
    /// Source is already stored.
    Skip,
}

impl ArtifactPipeline {
    /// Create a new pipeline.
    #[must_use]
    pub fn new(
        archives: ArchiveStore,
        builder: Arc<dyn BuildService>,
        synthesizer: Synthesizer,
        config: DeploymentConfig,
    ) -> Self {
        Self {
            archives,
            builder,
            synthesizer,
            config,
        }
    }

    /// Archive store the pipeline uploads to.
    #[must_use]
    pub const fn archives(&self) -> &ArchiveStore {
        &self.archives
    }

    /// Build service the pipeline builds with.
    #[must_use]
    pub fn builder(&self) -> &Arc<dyn BuildService> {
        &self.builder
    }

    /// Extract, synthesize, optionally upload, then build `tag`.
    pub async fn run(&self, archive: Bytes, tag: &str, upload: Upload<'_>) -> ControlResult<ImageRef> {
        let workspace = Workspace::create(self.config.workspace_root.as_deref(), "cirrus-deploy-")
            .map_err(|e| ControlError::deploy(DeployStage::Extraction, e))?;

        let result = self.run_in(&workspace, archive, tag, upload).await;
        workspace.release();
        result
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        archive: Bytes,
        tag: &str,
        upload: Upload<'_>,
    ) -> ControlResult<ImageRef> {
        let unpacked = unpack(archive, workspace.path(), self.config.extract_limits())
            .await
            .map_err(|e| ControlError::deploy(DeployStage::Extraction, e))?;
        debug!(files = unpacked.files, bytes = unpacked.bytes, "archive extracted");

        let synthesis = self
            .synthesizer
            .synthesize(workspace.path())
            .await
            .map_err(|e| ControlError::deploy(DeployStage::Synthesis, e))?;
        log_synthesis(&synthesis);

        if let Upload::To(key) = upload {
            let packed = pack_directory(workspace.path(), self.config.compression_level)
                .await
                .map_err(|e| ControlError::deploy(DeployStage::Upload, e))?;
            let size = packed.len();
            self.archives
                .put(key, packed)
                .await
                .map_err(|e| ControlError::deploy(DeployStage::Upload, e))?;
            debug!(key, size, "source archive stored");
        }

        let image = self
            .builder
            .build(workspace.path(), tag)
            .await
            .map_err(|e| ControlError::deploy(DeployStage::Build, e))?;
        info!(tag, image = %image.reference, "image built");

        Ok(image)
    }
}

fn log_synthesis(synthesis: &Synthesis) {
    debug!(
        handler = %synthesis.handler.qualified_name(),
        entrypoint = %synthesis.entrypoint_path.display(),
        manifest_changed = synthesis.manifest_changed,
        "entrypoint synthesized"
    );
}

impl std::fmt::Debug for ArtifactPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
