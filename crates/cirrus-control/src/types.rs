//! Core types for cirrus-control.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ControlError, ControlResult};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Internal function identifier (lowercase ULID).
    FunctionId
);
string_id!(
    /// Internal deployment identifier (lowercase ULID).
    DeploymentId
);
string_id!(
    /// Invocation identifier (lowercase ULID).
    InvocationId
);
string_id!(
    /// Reference to the owning user or organisation.
    OwnerId
);

fn generate_ulid() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

impl FunctionId {
    /// Generate a new unique function ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_ulid())
    }
}

impl DeploymentId {
    /// Generate a new unique deployment ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_ulid())
    }
}

impl InvocationId {
    /// Generate a new unique invocation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_ulid())
    }
}

/// Image tag for a function version.
#[must_use]
pub fn image_tag(function_id: &FunctionId, version: u32) -> String {
    format!("{function_id}-v{version}")
}

/// Object storage key of the synthesized source for a function version.
#[must_use]
pub fn archive_key(function_uuid: &Uuid, version: u32) -> String {
    format!("functions/{function_uuid}/v{version}/source.tar.zst")
}

/// Longest accepted function name.
pub const MAX_FUNCTION_NAME_LEN: usize = 63;

/// Check that a function name is a DNS-label-style identifier.
pub fn validate_function_name(name: &str) -> ControlResult<()> {
    if name.is_empty() || name.len() > MAX_FUNCTION_NAME_LEN {
        return Err(ControlError::validation(format!(
            "function name must be 1-{MAX_FUNCTION_NAME_LEN} characters"
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(ControlError::validation(
            "function name must start with a lowercase letter",
        ));
    }
    if name.ends_with('-') {
        return Err(ControlError::validation("function name must not end with '-'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ControlError::validation(
            "function name may only contain lowercase letters, digits and '-'",
        ));
    }
    Ok(())
}

/// Lifecycle status of a function.
///
/// ```text
/// Init ──▶ Building ──▶ Active ◀─┐
///             ▲  │         │     │ rollback
///             │  ▼         └─────┘
///             └─ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionStatus {
    /// Created, never deployed.
    Init,
    /// A deploy is in progress.
    Building,
    /// An active deployment is serving.
    Active,
    /// The most recent deploy failed.
    Failed,
}

impl FunctionStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Building => "building",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    /// Whether moving to `next` is a legal transition.
    ///
    /// `Building -> Building` is legal because overlapping deploys of one
    /// function each mark it building. `Active`/`Failed -> Active` covers
    /// rollback.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Building)
                | (Self::Building, Self::Building | Self::Active | Self::Failed)
                | (Self::Active, Self::Building | Self::Active | Self::Failed)
                | (Self::Failed, Self::Building | Self::Active | Self::Failed)
        )
    }

    /// Return `next` if the transition is legal.
    pub fn transition(self, next: Self) -> ControlResult<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ControlError::InvalidStateTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FunctionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "building" => Ok(Self::Building),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown function status: {s}")),
        }
    }
}

/// Status of a deployment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Version reserved, pipeline running.
    Building,
    /// Currently serving.
    Active,
    /// Superseded; still a rollback target.
    Disabled,
    /// Pipeline failed; never served.
    Failed,
}

impl DeploymentStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
        }
    }

    /// Whether the deployment produced a verified artifact.
    #[must_use]
    pub const fn is_rollback_target(&self) -> bool {
        matches!(self, Self::Active | Self::Disabled)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(Self::Building),
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Outcome of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Handler returned a result.
    Success,
    /// Handler, runtime or dispatcher reported an error.
    Error,
    /// Time limit exceeded.
    Timeout,
}

impl InvocationStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("unknown invocation status: {s}")),
        }
    }
}

/// A function as stored in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Internal identifier.
    pub id: FunctionId,
    /// Public identifier; keys stored archives.
    pub uuid: Uuid,
    /// Owner reference.
    pub owner_id: OwnerId,
    /// Name, unique per owner.
    pub name: String,
    /// Lifecycle status.
    pub status: FunctionStatus,
    /// Currently serving deployment.
    pub active_deployment_id: Option<DeploymentId>,
    /// When the function was created.
    pub created_at: DateTime<Utc>,
    /// When the function was last updated.
    pub updated_at: DateTime<Utc>,
}

impl FunctionRecord {
    /// Create a new function in the `init` state.
    #[must_use]
    pub fn new(owner_id: OwnerId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: FunctionId::generate(),
            uuid: Uuid::new_v4(),
            owner_id,
            name: name.into(),
            status: FunctionStatus::Init,
            active_deployment_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A deployment as stored in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Internal identifier.
    pub id: DeploymentId,
    /// Public identifier.
    pub uuid: Uuid,
    /// Owning function.
    pub function_id: FunctionId,
    /// Version number, starting at 1.
    pub version: u32,
    /// Image tag in the function repository.
    pub image_tag: String,
    /// Object storage key of the synthesized source.
    pub archive_key: String,
    /// Row status.
    pub status: DeploymentStatus,
    /// Whether this is the function's serving deployment.
    pub is_active: bool,
    /// When the version was reserved.
    pub created_at: DateTime<Utc>,
    /// When the deployment last became active.
    pub deployed_at: Option<DateTime<Utc>>,
    /// Failure message if the pipeline failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentRecord {
    /// Create a `building` row reserving `version` for `function`.
    #[must_use]
    pub fn reserve(function: &FunctionRecord, version: u32) -> Self {
        Self {
            id: DeploymentId::generate(),
            uuid: Uuid::new_v4(),
            function_id: function.id.clone(),
            version,
            image_tag: image_tag(&function.id, version),
            archive_key: archive_key(&function.uuid, version),
            status: DeploymentStatus::Building,
            is_active: false,
            created_at: Utc::now(),
            deployed_at: None,
            error: None,
        }
    }
}

/// An invocation as stored in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRecord {
    /// Invocation identifier.
    pub id: InvocationId,
    /// Invoked function.
    pub function_id: FunctionId,
    /// Deployment that served the invocation.
    pub deployment_id: DeploymentId,
    /// Outcome.
    pub status: InvocationStatus,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Error message for non-success outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Debug log lines captured from the handler.
    pub logs: Vec<String>,
    /// When the invocation started.
    pub timestamp: DateTime<Utc>,
}
