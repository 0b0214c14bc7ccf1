//! Cirrus Control Plane
//!
//! This crate provides the lifecycle layer for Cirrus functions: creating
//! functions, deploying new versions, rolling back to earlier ones and
//! dispatching invocations to the active version.
//!
//! # Architecture
//!
//! - **Deployment orchestration**: reserves a version, runs the artifact
//!   pipeline (extract, synthesize, upload, build) and activates the result
//! - **Version registry**: the metadata store keeps one active deployment
//!   per function and hands out strictly increasing version numbers
//! - **Rollback**: reactivates an earlier version, rebuilding its image from
//!   the stored source archive when the image is gone
//! - **Dispatch**: runs the active image in an isolated runtime under
//!   payload, concurrency and time limits, recording every invocation
//!
//! # Function lifecycle
//!
//! ```text
//! Init ──▶ Building ──▶ Active ◀─┐
//!             ▲  │         │     │ rollback
//!             │  ▼         └─────┘
//!             └─ Failed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use cirrus_control::{ControlConfig, ControlPlane, DeployRequest, OwnerId};
//!
//! let plane = ControlPlane::from_config(ControlConfig::load()?).await?;
//! let function = plane.initialize(OwnerId::new("acme"), "resize-image").await?;
//!
//! let outcome = plane
//!     .deploy(DeployRequest {
//!         owner_id: function.owner_id.clone(),
//!         function_id: function.id.clone(),
//!         archive: std::fs::read("function.tar.gz")?.into(),
//!     })
//!     .await?;
//! assert_eq!(outcome.version, 1);
//!
//! let result = plane.invoke(&function.id, r#"{"width":64}"#.into()).await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod deployment;
pub mod dispatch;
pub mod error;
pub mod plane;
pub mod runtime;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::{
    DeployOutcome, DeployRequest, RollbackOutcome, RollbackPath, RollbackRequest,
};
pub use dispatch::{ExecutionResult, InvocationOutcome};
pub use error::{ControlError, ControlResult};
pub use plane::{ControlDeps, ControlPlane};
pub use runtime::{IsolatedRuntime, MockRuntime, PodmanRuntime, RunLimits, RunOutcome, RunOutput};
pub use store::{MemoryStore, MetadataStore, PostgresStore};
pub use types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, FunctionId, FunctionRecord, FunctionStatus,
    InvocationId, InvocationRecord, InvocationStatus, OwnerId,
};
