//! Ephemeral build workspaces.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::BuildResult;

/// A scoped directory owned by a single deploy or rollback attempt.
///
/// The directory is removed when the workspace is dropped, so every exit
/// path (success, handled failure, panic unwinding) releases it.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a new workspace under `root`, or the system temp dir if `None`.
    pub fn create(root: Option<&Path>, label: &str) -> BuildResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(label);

        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        debug!(path = %dir.path().display(), "workspace created");
        Ok(Self { dir })
    }

    /// Path of the workspace directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the workspace now, logging instead of failing on error.
    pub fn release(self) {
        let path: PathBuf = self.dir.path().to_owned();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "workspace removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove workspace"),
        }
    }
}
