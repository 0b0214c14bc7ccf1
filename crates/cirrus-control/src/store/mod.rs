//! Metadata storage backends.
//!
//! This module provides the [`MetadataStore`] trait over function,
//! deployment and invocation records. The primary implementation uses
//! PostgreSQL; an in-memory implementation is provided for testing and
//! single-node development.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DatabaseConfig, StoreBackend};
use crate::error::ControlResult;
use crate::types::{
    DeploymentId, DeploymentRecord, FunctionId, FunctionRecord, InvocationRecord, OwnerId,
};

/// Backend for function, deployment and invocation records.
///
/// Operations that change which deployment is active, or which version
/// number is next, are atomic with respect to each other for the same
/// function. Everything else is a single-row read or write.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new function.
    ///
    /// Returns `AlreadyExists` if the owner already has a function with the
    /// same name.
    async fn create_function(&self, record: &FunctionRecord) -> ControlResult<()>;

    /// Get a function by ID.
    async fn get_function(&self, id: &FunctionId) -> ControlResult<Option<FunctionRecord>>;

    /// Find a function by owner and name.
    async fn find_function(
        &self,
        owner_id: &OwnerId,
        name: &str,
    ) -> ControlResult<Option<FunctionRecord>>;

    /// Reserve the next version of a function.
    ///
    /// Under the function's exclusive lock: checks the function may move to
    /// `building`, inserts a `building` deployment with version
    /// `max(version) + 1` and sets the function status to `building`.
    async fn reserve_deployment(&self, function_id: &FunctionId) -> ControlResult<DeploymentRecord>;

    /// Mark a reserved deployment as failed and the function as `failed`.
    ///
    /// The function's active deployment is left untouched.
    async fn fail_deployment(&self, deployment_id: &DeploymentId, error: &str) -> ControlResult<()>;

    /// Make `deployment_id` the function's only active deployment.
    ///
    /// In one transaction: the current active deployment (if any, and if
    /// different) becomes `disabled`, the target becomes `active`, and the
    /// function's active pointer and status are updated.
    async fn activate(
        &self,
        function_id: &FunctionId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord>;

    /// Get a deployment by ID.
    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Get a deployment by function and version.
    async fn get_deployment_by_version(
        &self,
        function_id: &FunctionId,
        version: u32,
    ) -> ControlResult<Option<DeploymentRecord>>;

    /// Get the function's active deployment.
    async fn get_active_deployment(
        &self,
        function_id: &FunctionId,
    ) -> ControlResult<Option<DeploymentRecord>>;

    /// List a function's deployments, ordered by version ascending.
    async fn list_deployments(&self, function_id: &FunctionId) -> ControlResult<Vec<DeploymentRecord>>;

    /// Insert an invocation record.
    async fn record_invocation(&self, record: &InvocationRecord) -> ControlResult<()>;

    /// List a function's most recent invocations, newest first.
    async fn list_invocations(
        &self,
        function_id: &FunctionId,
        limit: u32,
    ) -> ControlResult<Vec<InvocationRecord>>;
}

/// Create a metadata store from configuration.
pub async fn create_store(config: &DatabaseConfig) -> ControlResult<Arc<dyn MetadataStore>> {
    match config.backend {
        StoreBackend::Postgres => Ok(Arc::new(PostgresStore::connect(config).await?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
