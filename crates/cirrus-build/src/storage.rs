//! Source archive storage using object_store.
//!
//! Supports local filesystem, in-memory and S3 backends.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{BuildError, BuildResult};

/// Object storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Local filesystem rooted at `path`.
    #[default]
    Local,
    /// Process-local memory; contents are lost on exit.
    Memory,
    /// S3 or S3-compatible bucket named by `path`.
    S3,
}

/// Configuration for archive storage.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type.
    #[serde(default)]
    pub storage_type: StorageType,
    /// Base directory (local) or bucket name (S3).
    #[serde(default = "default_storage_path")]
    pub path: String,
    /// S3 region.
    pub region: Option<String>,
    /// S3 endpoint for S3-compatible stores.
    pub endpoint: Option<String>,
}

fn default_storage_path() -> String {
    "/var/lib/cirrus/archives".to_owned()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            path: default_storage_path(),
            region: None,
            endpoint: None,
        }
    }
}

/// Keyed blob storage for function source archives.
#[derive(Clone)]
pub struct ArchiveStore {
    store: Arc<dyn ObjectStore>,
}

impl ArchiveStore {
    /// Create an archive store from configuration.
    pub fn new(config: &StorageConfig) -> BuildResult<Self> {
        Ok(Self {
            store: create_object_store(config)?,
        })
    }

    /// Create an archive store with a pre-configured object store.
    #[must_use]
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Create an in-memory archive store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(object_store::memory::InMemory::new()))
    }

    /// Store `data` under `key`, replacing any existing object.
    pub async fn put(&self, key: &str, data: Bytes) -> BuildResult<()> {
        let size = data.len();
        self.store
            .put(&ObjectPath::from(key), data.into())
            .await
            .map_err(|e| BuildError::Upload {
                key: key.to_owned(),
                message: e.to_string(),
            })?;

        info!(key = %key, size, "archive stored");
        Ok(())
    }

    /// Fetch the object under `key`.
    pub async fn get(&self, key: &str) -> BuildResult<Bytes> {
        let result = self
            .store
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| match e {
                object_store::Error::NotFound { .. } => BuildError::ArchiveNotFound(key.to_owned()),
                other => BuildError::Storage(format!("failed to fetch {key}: {other}")),
            })?;

        let data = result
            .bytes()
            .await
            .map_err(|e| BuildError::Storage(format!("failed to read {key}: {e}")))?;

        debug!(key = %key, size = data.len(), "archive fetched");
        Ok(data)
    }

    /// Check whether an object exists under `key`.
    pub async fn exists(&self, key: &str) -> BuildResult<bool> {
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(BuildError::Storage(format!("failed to check {key}: {e}"))),
        }
    }

    /// Delete the object under `key`. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> BuildResult<()> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(BuildError::Storage(format!("failed to delete {key}: {e}"))),
        }
    }

    /// List every key under `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> BuildResult<Vec<String>> {
        let prefix = ObjectPath::from(prefix);
        let mut stream = self.store.list(Some(&prefix));

        let mut keys = Vec::new();
        while let Some(result) = stream.next().await {
            let meta = result.map_err(|e| BuildError::Storage(format!("failed to list: {e}")))?;
            keys.push(meta.location.to_string());
        }

        keys.sort();
        Ok(keys)
    }
}

impl std::fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("store", &self.store.to_string())
            .finish()
    }
}

/// Create an object store from configuration.
fn create_object_store(config: &StorageConfig) -> BuildResult<Arc<dyn ObjectStore>> {
    match config.storage_type {
        StorageType::Local => {
            std::fs::create_dir_all(&config.path)?;
            let store = object_store::local::LocalFileSystem::new_with_prefix(&config.path)
                .map_err(|e| BuildError::Storage(format!("failed to create local store: {e}")))?;
            Ok(Arc::new(store))
        }
        StorageType::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),
        #[cfg(feature = "aws")]
        StorageType::S3 => {
            use object_store::aws::AmazonS3Builder;

            let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.path);
            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &config.endpoint {
                builder = builder.with_endpoint(endpoint);
                if endpoint.starts_with("http://") {
                    builder = builder.with_allow_http(true);
                }
            }

            let store = builder
                .build()
                .map_err(|e| BuildError::Storage(format!("failed to create S3 store: {e}")))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "aws"))]
        StorageType::S3 => Err(BuildError::Storage(
            "S3 storage requires the `aws` feature".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_exists() {
        let store = ArchiveStore::in_memory();
        let key = "functions/abc/v1/source.tar.zst";

        assert!(!store.exists(key).await.unwrap());

        store.put(key, Bytes::from_static(b"data")).await.unwrap();
        assert!(store.exists(key).await.unwrap());
        assert_eq!(store.get(key).await.unwrap(), Bytes::from_static(b"data"));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = ArchiveStore::in_memory();
        let err = store.get("functions/none/v9/source.tar.zst").await.unwrap_err();
        assert!(matches!(err, BuildError::ArchiveNotFound(_)));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let store = ArchiveStore::in_memory();
        store
            .put("functions/a/v2/source.tar.zst", Bytes::from_static(b"2"))
            .await
            .unwrap();
        store
            .put("functions/a/v1/source.tar.zst", Bytes::from_static(b"1"))
            .await
            .unwrap();
        store
            .put("functions/b/v1/source.tar.zst", Bytes::from_static(b"b"))
            .await
            .unwrap();

        let keys = store.list("functions/a").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "functions/a/v1/source.tar.zst".to_owned(),
                "functions/a/v2/source.tar.zst".to_owned(),
            ]
        );

        store.delete("functions/a/v1/source.tar.zst").await.unwrap();
        store.delete("functions/a/v1/source.tar.zst").await.unwrap();
        assert_eq!(store.list("functions/a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_store_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            storage_type: StorageType::Local,
            path: dir.path().to_string_lossy().into_owned(),
            region: None,
            endpoint: None,
        };
        let store = ArchiveStore::new(&config).unwrap();

        store
            .put("functions/x/v1/source.tar.zst", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(dir.path().join("functions/x/v1/source.tar.zst").exists());
    }

    #[test]
    fn storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.storage_type, StorageType::Local);
        assert_eq!(config.path, "/var/lib/cirrus/archives");
    }
}
