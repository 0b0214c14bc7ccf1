//! Error types for the build pipeline.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage for error attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    /// Unpacking the uploaded archive into a workspace.
    Extraction,
    /// Entrypoint discovery, bootstrap generation and manifest patching.
    Synthesis,
    /// Storing the synthesized source in object storage.
    Upload,
    /// Producing a runnable image.
    Build,
}

impl DeployStage {
    /// Get the stage name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Synthesis => "synthesis",
            Self::Upload => "upload",
            Self::Build => "build",
        }
    }
}

impl std::fmt::Display for DeployStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while turning an archive into an image.
#[derive(Debug, Error)]
pub enum BuildError {
    // ─────────────────────────────────────────────────────────────────────────
    // Archive errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The uploaded archive contained no bytes.
    #[error("archive is empty")]
    EmptyArchive,

    /// The archive could not be decoded.
    #[error("failed to extract archive: {0}")]
    Extraction(String),

    /// An archive entry would land outside the workspace.
    #[error("archive entry escapes workspace: {}", .0.display())]
    UnsafeEntry(PathBuf),

    /// The archive unpacks to more than the configured ceiling.
    #[error("archive exceeds unpacked size limit of {limit} bytes")]
    ArchiveTooLarge {
        /// Maximum allowed unpacked size.
        limit: u64,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Synthesis errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Zero or several handlers carry the capability marker.
    #[error(
        "expected exactly one handler implementing {marker}, found {}{}",
        candidates.len(),
        if candidates.is_empty() { String::new() } else { format!(": {}", candidates.join(", ")) }
    )]
    AmbiguousEntrypoint {
        /// The marker that was searched for.
        marker: String,
        /// Fully qualified names of every match.
        candidates: Vec<String>,
    },

    /// A source file could not be parsed.
    #[error("failed to parse {}: {message}", path.display())]
    SourceParse {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// Bootstrap generation or manifest patching failed.
    #[error("entrypoint synthesis failed: {0}")]
    Synthesis(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Storage errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Writing an archive to object storage failed.
    #[error("failed to upload archive {key}: {message}")]
    Upload {
        /// Object key.
        key: String,
        /// Backend message.
        message: String,
    },

    /// No object exists under the key.
    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    /// Any other object storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Build service errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The build service rejected the source.
    #[error("image build failed for {tag} (exit code {exit_code}): {stderr}")]
    BuildFailed {
        /// Image tag being built.
        tag: String,
        /// Build tool exit code.
        exit_code: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// The build service could not be reached or invoked.
    #[error("build service error: {0}")]
    BuildService(String),

    /// Build exceeded its time limit.
    #[error("build timed out after {limit:?}")]
    Timeout {
        /// Timeout limit.
        limit: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Internal errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Create a synthesis error.
    #[must_use]
    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    /// Create an extraction error.
    #[must_use]
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The pipeline stage this error belongs to, if it is stage-specific.
    ///
    /// I/O and internal errors can occur in any stage; callers attribute
    /// those from context.
    #[must_use]
    pub const fn stage(&self) -> Option<DeployStage> {
        match self {
            Self::EmptyArchive
            | Self::Extraction(_)
            | Self::UnsafeEntry(_)
            | Self::ArchiveTooLarge { .. } => Some(DeployStage::Extraction),
            Self::AmbiguousEntrypoint { .. } | Self::SourceParse { .. } | Self::Synthesis(_) => {
                Some(DeployStage::Synthesis)
            }
            Self::Upload { .. } => Some(DeployStage::Upload),
            Self::BuildFailed { .. } | Self::BuildService(_) | Self::Timeout { .. } => {
                Some(DeployStage::Build)
            }
            Self::ArchiveNotFound(_) | Self::Storage(_) | Self::Io(_) | Self::Internal(_) => None,
        }
    }
}

/// Result type alias for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_entrypoint_lists_candidates() {
        let none = BuildError::AmbiguousEntrypoint {
            marker: "FunctionHandler".to_owned(),
            candidates: vec![],
        };
        assert_eq!(
            none.to_string(),
            "expected exactly one handler implementing FunctionHandler, found 0"
        );

        let two = BuildError::AmbiguousEntrypoint {
            marker: "FunctionHandler".to_owned(),
            candidates: vec!["app::A".to_owned(), "app::b::B".to_owned()],
        };
        assert_eq!(
            two.to_string(),
            "expected exactly one handler implementing FunctionHandler, found 2: app::A, app::b::B"
        );
    }

    #[test]
    fn errors_map_to_stages() {
        assert_eq!(BuildError::EmptyArchive.stage(), Some(DeployStage::Extraction));
        assert_eq!(
            BuildError::synthesis("no lib").stage(),
            Some(DeployStage::Synthesis)
        );
        assert_eq!(
            BuildError::Timeout {
                limit: Duration::from_secs(1)
            }
            .stage(),
            Some(DeployStage::Build)
        );
        assert_eq!(BuildError::internal("x").stage(), None);
    }

    #[test]
    fn stage_names() {
        assert_eq!(DeployStage::Extraction.to_string(), "extraction");
        assert_eq!(DeployStage::Build.as_str(), "build");
        let json = serde_json::to_string(&DeployStage::Synthesis).unwrap();
        assert_eq!(json, r#""synthesis""#);
    }
}
