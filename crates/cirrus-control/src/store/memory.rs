//! In-memory metadata store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, FunctionId, FunctionRecord, FunctionStatus,
    InvocationRecord, OwnerId,
};

use super::MetadataStore;

#[derive(Debug, Default)]
struct Inner {
    functions: HashMap<FunctionId, FunctionRecord>,
    deployments: HashMap<DeploymentId, DeploymentRecord>,
    invocations: Vec<InvocationRecord>,
}

/// In-memory metadata store.
///
/// All records live behind one lock, so every write is trivially atomic.
/// Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ControlResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }
}

impl Inner {
    fn function_mut(&mut self, id: &FunctionId) -> ControlResult<&mut FunctionRecord> {
        self.functions
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(format!("function {id}")))
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_function(&self, record: &FunctionRecord) -> ControlResult<()> {
        let mut inner = self.write()?;

        let name_taken = inner
            .functions
            .values()
            .any(|f| f.owner_id == record.owner_id && f.name == record.name);
        if name_taken {
            return Err(ControlError::AlreadyExists(format!(
                "function {} for owner {}",
                record.name, record.owner_id
            )));
        }
        if inner.functions.contains_key(&record.id) {
            return Err(ControlError::ConcurrencyConflict(format!(
                "function {} already exists",
                record.id
            )));
        }

        inner.functions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_function(&self, id: &FunctionId) -> ControlResult<Option<FunctionRecord>> {
        Ok(self.read()?.functions.get(id).cloned())
    }

    async fn find_function(
        &self,
        owner_id: &OwnerId,
        name: &str,
    ) -> ControlResult<Option<FunctionRecord>> {
        Ok(self
            .read()?
            .functions
            .values()
            .find(|f| &f.owner_id == owner_id && f.name == name)
            .cloned())
    }

    async fn reserve_deployment(&self, function_id: &FunctionId) -> ControlResult<DeploymentRecord> {
        let mut inner = self.write()?;

        let next_version = inner
            .deployments
            .values()
            .filter(|d| &d.function_id == function_id)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| ControlError::internal("version counter exhausted"))?;

        let function = inner.function_mut(function_id)?;
        function.status = function.status.transition(FunctionStatus::Building)?;
        function.updated_at = Utc::now();
        let record = DeploymentRecord::reserve(function, next_version);

        inner.deployments.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn fail_deployment(&self, deployment_id: &DeploymentId, error: &str) -> ControlResult<()> {
        let mut inner = self.write()?;

        let deployment = inner
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| ControlError::not_found(format!("deployment {deployment_id}")))?;
        deployment.status = DeploymentStatus::Failed;
        deployment.is_active = false;
        deployment.error = Some(error.to_owned());
        let function_id = deployment.function_id.clone();

        let function = inner.function_mut(&function_id)?;
        function.status = function.status.transition(FunctionStatus::Failed)?;
        function.updated_at = Utc::now();

        Ok(())
    }

    async fn activate(
        &self,
        function_id: &FunctionId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord> {
        let mut inner = self.write()?;

        match inner.deployments.get(deployment_id) {
            Some(d) if &d.function_id == function_id => {}
            _ => {
                return Err(ControlError::not_found(format!(
                    "deployment {deployment_id} of function {function_id}"
                )))
            }
        }

        let function = inner.function_mut(function_id)?;
        let next_status = function.status.transition(FunctionStatus::Active)?;
        function.status = next_status;
        function.active_deployment_id = Some(deployment_id.clone());
        function.updated_at = Utc::now();

        let now = Utc::now();
        let mut activated = None;
        for deployment in inner
            .deployments
            .values_mut()
            .filter(|d| &d.function_id == function_id)
        {
            if &deployment.id == deployment_id {
                deployment.status = DeploymentStatus::Active;
                deployment.is_active = true;
                deployment.deployed_at = Some(now);
                deployment.error = None;
                activated = Some(deployment.clone());
            } else if deployment.is_active {
                deployment.status = DeploymentStatus::Disabled;
                deployment.is_active = false;
            }
        }

        activated.ok_or_else(|| ControlError::internal("activated deployment vanished"))
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        Ok(self.read()?.deployments.get(id).cloned())
    }

    async fn get_deployment_by_version(
        &self,
        function_id: &FunctionId,
        version: u32,
    ) -> ControlResult<Option<DeploymentRecord>> {
        Ok(self
            .read()?
            .deployments
            .values()
            .find(|d| &d.function_id == function_id && d.version == version)
            .cloned())
    }

    async fn get_active_deployment(
        &self,
        function_id: &FunctionId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        Ok(self
            .read()?
            .deployments
            .values()
            .find(|d| &d.function_id == function_id && d.is_active)
            .cloned())
    }

    async fn list_deployments(&self, function_id: &FunctionId) -> ControlResult<Vec<DeploymentRecord>> {
        let mut deployments: Vec<_> = self
            .read()?
            .deployments
            .values()
            .filter(|d| &d.function_id == function_id)
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.version);
        Ok(deployments)
    }

    async fn record_invocation(&self, record: &InvocationRecord) -> ControlResult<()> {
        let mut inner = self.write()?;
        if !inner.functions.contains_key(&record.function_id) {
            return Err(ControlError::not_found(format!(
                "function {}",
                record.function_id
            )));
        }
        inner.invocations.push(record.clone());
        Ok(())
    }

    async fn list_invocations(
        &self,
        function_id: &FunctionId,
        limit: u32,
    ) -> ControlResult<Vec<InvocationRecord>> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let mut invocations: Vec<_> = self
            .read()?
            .invocations
            .iter()
            .filter(|i| &i.function_id == function_id)
            .cloned()
            .collect();
        invocations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        invocations.truncate(limit);
        Ok(invocations)
    }
}
