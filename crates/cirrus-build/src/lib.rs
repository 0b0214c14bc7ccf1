//! Artifact pipeline for Cirrus functions.
//!
//! This crate provides:
//! - Archive decoding with path containment and size limits
//! - Ephemeral workspaces scoped to one deploy or rollback attempt
//! - Entrypoint synthesis (handler discovery, bootstrap, manifest patching)
//! - Image build services (Podman CLI, in-memory mock)
//! - Source archive storage over `object_store`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Archive    │───▶│  Workspace   │───▶│ Synthesizer  │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!                                                │
//!         ┌──────────────────────────────────────┤
//!         ▼                                      ▼
//!  ┌──────────────┐                      ┌──────────────┐
//!  │ ArchiveStore │                      │ BuildService │
//!  │ (tar.zst)    │                      │  (podman)    │
//!  └──────────────┘                      └──────────────┘
//! ```

#![forbid(unsafe_code)]

pub mod archive;
pub mod builder;
pub mod error;
pub mod process;
pub mod storage;
pub mod synth;
pub mod workspace;

// Re-export error types
pub use error::{BuildError, BuildResult, DeployStage};

// Re-export archive types
pub use archive::{pack_directory, unpack, ArchiveFormat, ExtractLimits, Unpacked};

// Re-export build service types
pub use builder::{
    create_build_service, BuildService, BuildServiceConfig, BuildServiceType, ImageRef,
    MockBuildService, PodmanBuildService,
};

// Re-export storage types
pub use storage::{ArchiveStore, StorageConfig, StorageType};

// Re-export synthesis types
pub use synth::{
    HandlerSymbol, RustIntrospector, SourceIntrospector, Synthesis, SynthesisConfig, Synthesizer,
};

pub use workspace::Workspace;
