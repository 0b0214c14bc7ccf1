//! Common test utilities for control plane integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::path::Path as FsPath;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cirrus_build::{ArchiveStore, MockBuildService, SynthesisConfig, Synthesizer};
use cirrus_control::{
    config::{DispatchConfig, RuntimeConfig, RuntimeType, StoreBackend},
    ControlConfig, ControlDeps, ControlError, ControlPlane, ControlResult, DeployOutcome,
    DeployRequest, DeploymentId, DeploymentRecord, FunctionId, FunctionRecord, InvocationRecord,
    MemoryStore, MetadataStore, MockRuntime, OwnerId, RollbackOutcome, RollbackRequest,
};
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use tempfile::TempDir;

/// Metadata store that counts every call before delegating to memory.
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: MemoryStore,
    calls: AtomicUsize,
    fail_records: AtomicBool,
}

impl CountingStore {
    /// Number of store calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes `record_invocation` fail.
    pub fn set_failing_records(&self, failing: bool) {
        self.fail_records.store(failing, Ordering::SeqCst);
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for CountingStore {
    async fn create_function(&self, record: &FunctionRecord) -> ControlResult<()> {
        self.count();
        self.inner.create_function(record).await
    }

    async fn get_function(&self, id: &FunctionId) -> ControlResult<Option<FunctionRecord>> {
        self.count();
        self.inner.get_function(id).await
    }

    async fn find_function(
        &self,
        owner_id: &OwnerId,
        name: &str,
    ) -> ControlResult<Option<FunctionRecord>> {
        self.count();
        self.inner.find_function(owner_id, name).await
    }

    async fn reserve_deployment(&self, function_id: &FunctionId) -> ControlResult<DeploymentRecord> {
        self.count();
        self.inner.reserve_deployment(function_id).await
    }

    async fn fail_deployment(&self, deployment_id: &DeploymentId, error: &str) -> ControlResult<()> {
        self.count();
        self.inner.fail_deployment(deployment_id, error).await
    }

    async fn activate(
        &self,
        function_id: &FunctionId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord> {
        self.count();
        self.inner.activate(function_id, deployment_id).await
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        self.count();
        self.inner.get_deployment(id).await
    }

    async fn get_deployment_by_version(
        &self,
        function_id: &FunctionId,
        version: u32,
    ) -> ControlResult<Option<DeploymentRecord>> {
        self.count();
        self.inner.get_deployment_by_version(function_id, version).await
    }

    async fn get_active_deployment(
        &self,
        function_id: &FunctionId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        self.count();
        self.inner.get_active_deployment(function_id).await
    }

    async fn list_deployments(&self, function_id: &FunctionId) -> ControlResult<Vec<DeploymentRecord>> {
        self.count();
        self.inner.list_deployments(function_id).await
    }

    async fn record_invocation(&self, record: &InvocationRecord) -> ControlResult<()> {
        self.count();
        if self.fail_records.load(Ordering::SeqCst) {
            return Err(ControlError::internal("invocation table unavailable"));
        }
        self.inner.record_invocation(record).await
    }

    async fn list_invocations(
        &self,
        function_id: &FunctionId,
        limit: u32,
    ) -> ControlResult<Vec<InvocationRecord>> {
        self.count();
        self.inner.list_invocations(function_id, limit).await
    }
}

/// In-memory object store whose writes can be switched off.
#[derive(Debug, Default)]
pub struct SwitchableObjectStore {
    inner: InMemory,
    fail_puts: AtomicBool,
}

impl SwitchableObjectStore {
    /// Makes every write fail.
    pub fn set_failing_puts(&self, failing: bool) {
        self.fail_puts.store(failing, Ordering::SeqCst);
    }

    fn check_put(&self, location: &Path) -> object_store::Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(object_store::Error::Generic {
                store: "switchable",
                source: format!("writes disabled for {location}").into(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for SwitchableObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SwitchableObjectStore")
    }
}

#[async_trait]
impl ObjectStore for SwitchableObjectStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.check_put(location)?;
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.check_put(location)?;
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Complete control plane wired to in-memory backends.
pub struct TestPlane {
    pub plane: ControlPlane,
    pub store: Arc<CountingStore>,
    pub archives: ArchiveStore,
    pub objects: Arc<SwitchableObjectStore>,
    pub builder: Arc<MockBuildService>,
    pub runtime: Arc<MockRuntime>,
    pub owner: OwnerId,
    _workspaces: TempDir,
}

impl TestPlane {
    /// Creates a test plane with default configuration and an echo runtime.
    pub fn new() -> Self {
        Self::with(MockBuildService::default(), MockRuntime::new(), test_config())
    }

    /// Creates a test plane with custom mocks and configuration.
    pub fn with(builder: MockBuildService, runtime: MockRuntime, mut config: ControlConfig) -> Self {
        let workspaces = TempDir::new().expect("failed to create workspace root");
        config.deployment.workspace_root = Some(workspaces.path().to_owned());

        let store = Arc::new(CountingStore::default());
        let objects = Arc::new(SwitchableObjectStore::default());
        let archives = ArchiveStore::with_store(objects.clone());
        let builder = Arc::new(builder);
        let runtime = Arc::new(runtime);

        let plane = ControlPlane::new(ControlDeps {
            store: store.clone(),
            archives: archives.clone(),
            builder: builder.clone(),
            runtime: runtime.clone(),
            synthesizer: Synthesizer::new(SynthesisConfig::default()),
            config,
        });

        Self {
            plane,
            store,
            archives,
            objects,
            builder,
            runtime,
            owner: OwnerId::new("test-owner"),
            _workspaces: workspaces,
        }
    }

    /// Creates a function owned by the test owner.
    pub async fn function(&self, name: &str) -> FunctionRecord {
        self.plane
            .initialize(self.owner.clone(), name)
            .await
            .expect("initialize failed")
    }

    /// Deploys an archive as the test owner.
    pub async fn deploy(&self, function: &FunctionRecord, archive: Bytes) -> ControlResult<DeployOutcome> {
        self.plane
            .deploy(DeployRequest {
                owner_id: self.owner.clone(),
                function_id: function.id.clone(),
                archive,
            })
            .await
    }

    /// Rolls back as the test owner.
    pub async fn rollback(&self, function: &FunctionRecord, version: u32) -> ControlResult<RollbackOutcome> {
        self.plane
            .rollback(RollbackRequest {
                owner_id: self.owner.clone(),
                function_id: function.id.clone(),
                version,
            })
            .await
    }

    /// The function's current active deployment.
    pub async fn active(&self, function: &FunctionRecord) -> Option<DeploymentRecord> {
        self.store
            .get_active_deployment(&function.id)
            .await
            .expect("get_active_deployment failed")
    }

    /// Entries left behind in the workspace root.
    pub fn leftover_workspaces(&self) -> Vec<String> {
        leftovers(self._workspaces.path())
    }

    /// The deployment with `version`.
    pub async fn version(&self, function: &FunctionRecord, version: u32) -> DeploymentRecord {
        self.store
            .get_deployment_by_version(&function.id, version)
            .await
            .expect("get_deployment_by_version failed")
            .expect("version not found")
    }
}

impl Default for TestPlane {
    fn default() -> Self {
        Self::new()
    }
}

fn leftovers(root: &FsPath) -> Vec<String> {
    std::fs::read_dir(root)
        .expect("failed to read workspace root")
        .map(|entry| {
            entry
                .expect("failed to read workspace entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

/// Configuration for in-memory backends with short limits.
pub fn test_config() -> ControlConfig {
    let mut config = ControlConfig::default();
    config.database.backend = StoreBackend::Memory;
    config.runtime = RuntimeConfig {
        runtime_type: RuntimeType::Mock,
        timeout_ms: 1_000,
        grace_ms: 200,
        ..RuntimeConfig::default()
    };
    config.dispatch = DispatchConfig {
        max_payload_bytes: 1024,
        max_concurrent_per_function: 4,
        queue_timeout_ms: 100,
    };
    config
}

/// A runtime configuration whose time limit is `limit`.
pub fn runtime_with_timeout(limit: Duration) -> RuntimeConfig {
    RuntimeConfig {
        runtime_type: RuntimeType::Mock,
        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        grace_ms: 200,
        ..RuntimeConfig::default()
    }
}
