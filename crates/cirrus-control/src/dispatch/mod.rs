//! Invocation dispatch.
//!
//! The dispatcher routes a payload to the function's active deployment,
//! enforces payload size and per-function concurrency limits, runs the
//! image in the isolated runtime under a hard time limit and records one
//! invocation row per attempt.

mod limiter;

pub use limiter::ConcurrencyLimiter;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use cirrus_build::BuildService;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::{DispatchConfig, RuntimeConfig};
use crate::error::{ControlError, ControlResult};
use crate::runtime::{IsolatedRuntime, RunLimits, RunOutcome};
use crate::store::MetadataStore;
use crate::types::{
    DeploymentId, DeploymentRecord, FunctionId, InvocationId, InvocationRecord, InvocationStatus,
};

/// Result of a completed invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The handler returned a value.
    Success {
        /// Handler output.
        output: Value,
    },
    /// The handler or runtime reported an error.
    Error {
        /// Error message.
        message: String,
    },
    /// The time limit expired.
    Timeout,
}

impl InvocationOutcome {
    /// Status stored in the invocation row.
    #[must_use]
    pub const fn status(&self) -> InvocationStatus {
        match self {
            Self::Success { .. } => InvocationStatus::Success,
            Self::Error { .. } => InvocationStatus::Error,
            Self::Timeout => InvocationStatus::Timeout,
        }
    }
}

/// What `invoke` returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Invocation identifier.
    pub invocation_id: InvocationId,
    /// Deployment that served the request.
    pub deployment_id: DeploymentId,
    /// Version that served the request.
    pub version: u32,
    /// Outcome.
    pub outcome: InvocationOutcome,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Captured log lines.
    pub logs: Vec<String>,
    /// Time limit that applied.
    #[serde(skip)]
    pub limit: Duration,
}

impl ExecutionResult {
    /// Convert the outcome into a `Result` carrying the handler output.
    pub fn into_output(self) -> ControlResult<Value> {
        match self.outcome {
            InvocationOutcome::Success { output } => Ok(output),
            InvocationOutcome::Error { message } => Err(ControlError::ExecutionRuntime(message)),
            InvocationOutcome::Timeout => Err(ControlError::ExecutionTimeout { limit: self.limit }),
        }
    }
}

/// Routes invocations to active deployments.
pub struct Dispatcher {
    store: Arc<dyn MetadataStore>,
    builder: Arc<dyn BuildService>,
    runtime: Arc<dyn IsolatedRuntime>,
    limiter: ConcurrencyLimiter,
    dispatch: DispatchConfig,
    runtime_config: RuntimeConfig,
}

impl Dispatcher {
    /// Create a new dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        builder: Arc<dyn BuildService>,
        runtime: Arc<dyn IsolatedRuntime>,
        dispatch: DispatchConfig,
        runtime_config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            builder,
            runtime,
            limiter: ConcurrencyLimiter::new(dispatch.max_concurrent_per_function),
            dispatch,
            runtime_config,
        }
    }

    /// Invocations of `function_id` currently running.
    #[must_use]
    pub fn in_flight(&self, function_id: &FunctionId) -> usize {
        self.limiter.in_flight(function_id)
    }

    /// Invoke the active deployment of a function.
    ///
    /// Handler errors and timeouts are returned as an [`ExecutionResult`];
    /// `Err` is reserved for requests that never reached a runtime.
    #[instrument(skip(self, payload), fields(function_id = %function_id, size = payload.len()))]
    pub async fn invoke(
        &self,
        function_id: &FunctionId,
        payload: Bytes,
    ) -> ControlResult<ExecutionResult> {
        if payload.len() > self.dispatch.max_payload_bytes {
            return Err(ControlError::PayloadTooLarge {
                size: payload.len(),
                limit: self.dispatch.max_payload_bytes,
            });
        }

        if !payload.is_empty() {
            serde_json::from_slice::<serde::de::IgnoredAny>(&payload)
                .map_err(|e| ControlError::validation(format!("payload is not valid JSON: {e}")))?;
        }

        let deployment = self.resolve_active(function_id).await?;
        let invocation_id = InvocationId::generate();

        let _permit = match self
            .limiter
            .acquire(function_id, self.dispatch.queue_timeout())
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                if let ControlError::Overloaded { waited, .. } = &e {
                    warn!(waited_ms = waited.as_millis(), "rejecting invocation, function overloaded");
                    let record = InvocationRecord {
                        id: invocation_id,
                        function_id: function_id.clone(),
                        deployment_id: deployment.id.clone(),
                        status: InvocationStatus::Error,
                        duration_ms: millis(*waited),
                        error: Some(e.to_string()),
                        logs: Vec::new(),
                        timestamp: Utc::now(),
                    };
                    self.record(&record).await;
                }
                return Err(e);
            }
        };

        let image = self.builder.image_ref(&deployment.image_tag);
        let limits = RunLimits::from_config(&self.runtime_config);
        let deadline = limits.timeout + self.runtime_config.grace();

        debug!(image = %image.reference, version = deployment.version, "dispatching");

        let start = Instant::now();
        let (outcome, logs) = match timeout(deadline, self.runtime.run(&image, payload, &limits)).await
        {
            Ok(Ok(output)) => {
                let logs = output.logs();
                let outcome = match output.outcome {
                    RunOutcome::Success(output) => InvocationOutcome::Success { output },
                    RunOutcome::Error(message) => InvocationOutcome::Error { message },
                    RunOutcome::Timeout => InvocationOutcome::Timeout,
                };
                (outcome, logs)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "runtime failed to start function");
                (
                    InvocationOutcome::Error {
                        message: e.to_string(),
                    },
                    Vec::new(),
                )
            }
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis(), "runtime did not return before deadline");
                (InvocationOutcome::Timeout, Vec::new())
            }
        };
        let duration_ms = millis(start.elapsed());

        let error = match &outcome {
            InvocationOutcome::Success { .. } => None,
            InvocationOutcome::Error { message } => Some(message.clone()),
            InvocationOutcome::Timeout => Some(format!(
                "execution timed out after {}ms",
                limits.timeout.as_millis()
            )),
        };

        let record = InvocationRecord {
            id: invocation_id.clone(),
            function_id: function_id.clone(),
            deployment_id: deployment.id.clone(),
            status: outcome.status(),
            duration_ms,
            error,
            logs: logs.clone(),
            timestamp: Utc::now(),
        };
        self.record(&record).await;

        info!(
            invocation_id = %invocation_id,
            version = deployment.version,
            status = %record.status,
            duration_ms,
            "invocation finished"
        );

        Ok(ExecutionResult {
            invocation_id,
            deployment_id: deployment.id,
            version: deployment.version,
            outcome,
            duration_ms,
            logs,
            limit: limits.timeout,
        })
    }

    async fn resolve_active(&self, function_id: &FunctionId) -> ControlResult<DeploymentRecord> {
        if self.store.get_function(function_id).await?.is_none() {
            return Err(ControlError::not_found(format!("function {function_id}")));
        }

        self.store
            .get_active_deployment(function_id)
            .await?
            .ok_or_else(|| {
                ControlError::not_found(format!("function {function_id} has no active deployment"))
            })
    }

    /// Store an invocation row. Failures are logged, never returned.
    async fn record(&self, record: &InvocationRecord) {
        if let Err(e) = self.store.record_invocation(record).await {
            warn!(
                invocation_id = %record.id,
                error = %e,
                kind = e.kind(),
                "failed to record invocation"
            );
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("limiter", &self.limiter)
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}
