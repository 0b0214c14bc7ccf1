//! Configuration for cirrus-control.

use std::path::PathBuf;
use std::time::Duration;

use cirrus_build::{BuildServiceConfig, ExtractLimits, StorageConfig, SynthesisConfig};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Metadata store configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Source archive storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Image build configuration.
    #[serde(default)]
    pub build: BuildServiceConfig,

    /// Isolated runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Invocation dispatch limits.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Deploy pipeline configuration.
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Entrypoint synthesis configuration.
    #[serde(default)]
    pub synthesis: SynthesisConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `control.toml` in the current directory (if present)
    /// 3. Environment variables with `CIRRUS_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::file("control.toml")))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::file(path.as_ref())))
    }

    fn from_figment(figment: Figment) -> ControlResult<Self> {
        let mut config: Self = figment
            .merge(Env::prefixed("CIRRUS_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))?;
        config.align();
        Ok(config)
    }

    /// Keep settings that must agree across sections consistent.
    ///
    /// The image build compiles the binary the synthesizer generates, so the
    /// synthesis bootstrap name wins.
    pub fn align(&mut self) {
        self.build
            .bootstrap_name
            .clone_from(&self.synthesis.bootstrap_name);
    }
}

/// Metadata store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// PostgreSQL via sqlx.
    #[default]
    Postgres,
    /// Process-local memory.
    Memory,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Store backend.
    #[serde(default)]
    pub backend: StoreBackend,

    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/cirrus".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Isolated runtime backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    /// `podman run` per invocation.
    #[default]
    Podman,
    /// In-process mock for testing.
    Mock,
}

/// Isolated runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime backend.
    #[serde(default)]
    pub runtime_type: RuntimeType,

    /// Path or name of the podman binary.
    #[serde(default = "default_podman_binary")]
    pub binary: String,

    /// Container network mode.
    #[serde(default = "default_network")]
    pub network: String,

    /// Memory ceiling in MiB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    /// Memory plus swap ceiling in MiB.
    #[serde(default = "default_memory_mb")]
    pub memory_swap_mb: u32,

    /// CPU quota.
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// Invocation time limit in milliseconds.
    #[serde(default = "default_invoke_timeout_ms")]
    pub timeout_ms: u64,

    /// Extra time the dispatcher waits beyond the runtime's own limit.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Signal sent to containers that exceed their time limit.
    #[serde(default = "default_kill_signal")]
    pub kill_signal: String,
}

fn default_podman_binary() -> String {
    "podman".to_owned()
}

fn default_network() -> String {
    "none".to_owned()
}

const fn default_memory_mb() -> u32 {
    20
}

const fn default_cpus() -> f64 {
    0.5
}

const fn default_invoke_timeout_ms() -> u64 {
    30_000
}

const fn default_grace_ms() -> u64 {
    2_000
}

fn default_kill_signal() -> String {
    "SIGKILL".to_owned()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: RuntimeType::default(),
            binary: default_podman_binary(),
            network: default_network(),
            memory_mb: default_memory_mb(),
            memory_swap_mb: default_memory_mb(),
            cpus: default_cpus(),
            timeout_ms: default_invoke_timeout_ms(),
            grace_ms: default_grace_ms(),
            kill_signal: default_kill_signal(),
        }
    }
}

impl RuntimeConfig {
    /// Invocation time limit.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Grace period beyond the time limit.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Invocation dispatch limits.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Largest accepted payload.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// In-flight invocations allowed per function.
    #[serde(default = "default_max_concurrent_per_function")]
    pub max_concurrent_per_function: usize,

    /// How long a request may wait for a slot before being rejected.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

const fn default_max_payload_bytes() -> usize {
    6 * 1024 * 1024
}

const fn default_max_concurrent_per_function() -> usize {
    10
}

const fn default_queue_timeout_ms() -> u64 {
    5_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            max_concurrent_per_function: default_max_concurrent_per_function(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

impl DispatchConfig {
    /// Queue wait limit.
    #[must_use]
    pub const fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Deploy pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    /// Directory for ephemeral workspaces; system temp dir if unset.
    pub workspace_root: Option<PathBuf>,

    /// Largest accepted upload.
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: usize,

    /// Largest total unpacked size.
    #[serde(default = "default_max_unpacked_bytes")]
    pub max_unpacked_bytes: u64,

    /// Most entries an archive may contain.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Zstd level for stored archives.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

const fn default_max_archive_bytes() -> usize {
    50 * 1024 * 1024
}

const fn default_max_unpacked_bytes() -> u64 {
    256 * 1024 * 1024
}

const fn default_max_entries() -> usize {
    10_000
}

const fn default_compression_level() -> i32 {
    3
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            max_archive_bytes: default_max_archive_bytes(),
            max_unpacked_bytes: default_max_unpacked_bytes(),
            max_entries: default_max_entries(),
            compression_level: default_compression_level(),
        }
    }
}

impl DeploymentConfig {
    /// Limits applied when unpacking uploads.
    #[must_use]
    pub const fn extract_limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_unpacked_bytes: self.max_unpacked_bytes,
            max_entries: self.max_entries,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cirrus_build::{BuildServiceType, StorageType};

    #[test]
    fn default_config_is_valid() {
        let config = ControlConfig::default();
        assert_eq!(config.database.backend, StoreBackend::Postgres);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.runtime.network, "none");
        assert_eq!(config.runtime.memory_mb, 20);
        assert_eq!(config.runtime.memory_swap_mb, 20);
        assert!((config.runtime.cpus - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.runtime.kill_signal, "SIGKILL");
        assert_eq!(config.dispatch.max_payload_bytes, 6 * 1024 * 1024);
        assert_eq!(config.synthesis.bootstrap_name, "cirrus-bootstrap");
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [database]
            backend = "memory"

            [storage]
            storage_type = "memory"

            [build]
            service_type = "mock"
            no_cache = true

            [runtime]
            runtime_type = "mock"
            timeout_ms = 500

            [dispatch]
            max_concurrent_per_function = 2

            [synthesis]
            marker = "my_sdk::Handler"
            bootstrap_name = "entry"
        "#;

        let mut config: ControlConfig = toml::from_str(toml).unwrap();
        config.align();

        assert_eq!(config.database.backend, StoreBackend::Memory);
        assert_eq!(config.storage.storage_type, StorageType::Memory);
        assert_eq!(config.build.service_type, BuildServiceType::Mock);
        assert!(config.build.no_cache);
        assert_eq!(config.runtime.runtime_type, RuntimeType::Mock);
        assert_eq!(config.runtime.timeout(), Duration::from_millis(500));
        assert_eq!(config.dispatch.max_concurrent_per_function, 2);
        assert_eq!(config.synthesis.marker, "my_sdk::Handler");
        assert_eq!(config.build.bootstrap_name, "entry");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = ControlConfig::from_file("/nonexistent/control.toml").unwrap();
        assert_eq!(config.dispatch.queue_timeout(), Duration::from_secs(5));
    }
}
