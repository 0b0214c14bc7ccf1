//! Image build services.
//!
//! A build service turns a synthesized crate directory into a runnable image
//! identified by a tag. The Podman implementation shells out to the `podman`
//! CLI; [`MockBuildService`] keeps images in memory for tests.

mod podman;

pub use podman::{BuildServiceConfig, BuildServiceType, PodmanBuildService};

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BuildError, BuildResult};

/// A built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Tag within the function repository, e.g. `01j...-v3`.
    pub tag: String,
    /// Fully qualified reference passed to the runtime.
    pub reference: String,
}

/// Trait for image build backends.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Build an image from `source_dir` and tag it `tag`, replacing any
    /// existing image with that tag.
    async fn build(&self, source_dir: &Path, tag: &str) -> BuildResult<ImageRef>;

    /// Check whether an image tagged `tag` exists.
    async fn image_exists(&self, tag: &str) -> BuildResult<bool>;

    /// Remove the image tagged `tag`. Removing a missing image succeeds.
    async fn remove_image(&self, tag: &str) -> BuildResult<()>;

    /// Remove untagged images left behind by rebuilds.
    async fn prune_dangling(&self) -> BuildResult<()>;

    /// Resolve a tag to the reference the runtime should start.
    fn image_ref(&self, tag: &str) -> ImageRef;
}

/// Create a build service from configuration.
pub fn create_build_service(config: &BuildServiceConfig) -> BuildResult<Arc<dyn BuildService>> {
    match config.service_type {
        BuildServiceType::Podman => Ok(Arc::new(PodmanBuildService::new(config.clone()))),
        BuildServiceType::Mock => Ok(Arc::new(MockBuildService::default())),
    }
}

/// In-memory build service for testing.
///
/// A build succeeds when the source directory contains a `Cargo.toml`,
/// unless failures have been switched on with [`MockBuildService::set_failing`].
#[derive(Debug, Default)]
pub struct MockBuildService {
    images: RwLock<HashSet<String>>,
    builds: AtomicUsize,
    prunes: AtomicUsize,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl MockBuildService {
    /// Create a mock whose builds take `delay` to complete.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Number of `build` calls, including failed ones.
    #[must_use]
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of `prune_dangling` calls.
    #[must_use]
    pub fn prune_count(&self) -> usize {
        self.prunes.load(Ordering::SeqCst)
    }

    /// Make subsequent builds fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether an image with `tag` exists.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.images.read().is_ok_and(|images| images.contains(tag))
    }

    /// Drop an image, as if it had been garbage collected.
    pub fn evict(&self, tag: &str) {
        if let Ok(mut images) = self.images.write() {
            images.remove(tag);
        }
    }
}

#[async_trait]
impl BuildService for MockBuildService {
    async fn build(&self, source_dir: &Path, tag: &str) -> BuildResult<ImageRef> {
        self.builds.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(BuildError::BuildFailed {
                tag: tag.to_owned(),
                exit_code: 1,
                stderr: "mock build failure".to_owned(),
            });
        }
        if !source_dir.join("Cargo.toml").is_file() {
            return Err(BuildError::BuildFailed {
                tag: tag.to_owned(),
                exit_code: 101,
                stderr: "could not find `Cargo.toml`".to_owned(),
            });
        }

        self.images
            .write()
            .map_err(|_| BuildError::internal("lock poisoned"))?
            .insert(tag.to_owned());

        Ok(self.image_ref(tag))
    }

    async fn image_exists(&self, tag: &str) -> BuildResult<bool> {
        let images = self
            .images
            .read()
            .map_err(|_| BuildError::internal("lock poisoned"))?;
        Ok(images.contains(tag))
    }

    async fn remove_image(&self, tag: &str) -> BuildResult<()> {
        self.images
            .write()
            .map_err(|_| BuildError::internal("lock poisoned"))?
            .remove(tag);
        Ok(())
    }

    async fn prune_dangling(&self) -> BuildResult<()> {
        self.prunes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn image_ref(&self, tag: &str) -> ImageRef {
        ImageRef {
            tag: tag.to_owned(),
            reference: format!("mock/{tag}"),
        }
    }
}
