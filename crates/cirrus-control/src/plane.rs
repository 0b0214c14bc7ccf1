//! The control plane facade.

use std::sync::Arc;

use bytes::Bytes;
use cirrus_build::{create_build_service, ArchiveStore, BuildService, Synthesizer};
use tracing::{info, instrument};

use crate::config::ControlConfig;
use crate::deployment::{
    ArtifactPipeline, DeployOutcome, DeployRequest, DeploymentOrchestrator, RollbackOutcome,
    RollbackRequest, RollbackResolver,
};
use crate::dispatch::{Dispatcher, ExecutionResult};
use crate::error::{ControlError, ControlResult};
use crate::runtime::{create_runtime, IsolatedRuntime};
use crate::store::{create_store, MetadataStore};
use crate::types::{
    validate_function_name, DeploymentRecord, FunctionId, FunctionRecord, InvocationRecord,
    OwnerId,
};

/// Shared clients the control plane is built from.
pub struct ControlDeps {
    /// Metadata store.
    pub store: Arc<dyn MetadataStore>,
    /// Source archive storage.
    pub archives: ArchiveStore,
    /// Image build service.
    pub builder: Arc<dyn BuildService>,
    /// Isolated runtime.
    pub runtime: Arc<dyn IsolatedRuntime>,
    /// Entrypoint synthesizer.
    pub synthesizer: Synthesizer,
    /// Configuration.
    pub config: ControlConfig,
}

impl ControlDeps {
    /// Build every client from configuration.
    pub async fn from_config(config: ControlConfig) -> ControlResult<Self> {
        let store = create_store(&config.database).await?;
        let archives = ArchiveStore::new(&config.storage)?;
        let builder = create_build_service(&config.build)?;
        let runtime = create_runtime(&config.runtime)?;
        let synthesizer = Synthesizer::new(config.synthesis.clone());

        Ok(Self {
            store,
            archives,
            builder,
            runtime,
            synthesizer,
            config,
        })
    }
}

/// Entry point for function lifecycle operations.
///
/// Each operation returns a [`ControlResult`]; an inbound adapter maps
/// errors to responses with [`ControlError::status_code`].
pub struct ControlPlane {
    store: Arc<dyn MetadataStore>,
    orchestrator: DeploymentOrchestrator,
    resolver: RollbackResolver,
    dispatcher: Dispatcher,
}

impl ControlPlane {
    /// Wire the control plane from its dependencies.
    #[must_use]
    pub fn new(deps: ControlDeps) -> Self {
        let ControlDeps {
            store,
            archives,
            builder,
            runtime,
            synthesizer,
            config,
        } = deps;

        let pipeline = Arc::new(ArtifactPipeline::new(
            archives,
            builder.clone(),
            synthesizer,
            config.deployment.clone(),
        ));

        Self {
            orchestrator: DeploymentOrchestrator::new(
                store.clone(),
                pipeline.clone(),
                config.deployment.max_archive_bytes,
            ),
            resolver: RollbackResolver::new(store.clone(), pipeline),
            dispatcher: Dispatcher::new(
                store.clone(),
                builder,
                runtime,
                config.dispatch,
                config.runtime,
            ),
            store,
        }
    }

    /// Build the control plane and all of its clients from configuration.
    pub async fn from_config(config: ControlConfig) -> ControlResult<Self> {
        Ok(Self::new(ControlDeps::from_config(config).await?))
    }

    /// Create a function in the `init` state.
    #[instrument(skip(self, owner_id), fields(owner_id = %owner_id))]
    pub async fn initialize(&self, owner_id: OwnerId, name: &str) -> ControlResult<FunctionRecord> {
        validate_function_name(name)?;

        if self.store.find_function(&owner_id, name).await?.is_some() {
            return Err(ControlError::AlreadyExists(format!(
                "function {name} for owner {owner_id}"
            )));
        }

        let function = FunctionRecord::new(owner_id, name);
        self.store.create_function(&function).await?;

        info!(function_id = %function.id, name, "function initialized");
        Ok(function)
    }

    /// Deploy a new version of a function.
    pub async fn deploy(&self, request: DeployRequest) -> ControlResult<DeployOutcome> {
        self.orchestrator.deploy(request).await
    }

    /// Reactivate a previous version of a function.
    pub async fn rollback(&self, request: RollbackRequest) -> ControlResult<RollbackOutcome> {
        self.resolver.rollback(request).await
    }

    /// Invoke the active deployment of a function.
    pub async fn invoke(
        &self,
        function_id: &FunctionId,
        payload: Bytes,
    ) -> ControlResult<ExecutionResult> {
        self.dispatcher.invoke(function_id, payload).await
    }

    /// Get a function.
    pub async fn get_function(&self, function_id: &FunctionId) -> ControlResult<FunctionRecord> {
        self.store
            .get_function(function_id)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("function {function_id}")))
    }

    /// List a function's deployments, oldest version first.
    pub async fn list_deployments(
        &self,
        function_id: &FunctionId,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        self.get_function(function_id).await?;
        self.store.list_deployments(function_id).await
    }

    /// List a function's most recent invocations, newest first.
    pub async fn list_invocations(
        &self,
        function_id: &FunctionId,
        limit: u32,
    ) -> ControlResult<Vec<InvocationRecord>> {
        self.get_function(function_id).await?;
        self.store.list_invocations(function_id, limit).await
    }

    /// Invocations of a function currently running.
    #[must_use]
    pub fn in_flight(&self, function_id: &FunctionId) -> usize {
        self.dispatcher.in_flight(function_id)
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("orchestrator", &self.orchestrator)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
