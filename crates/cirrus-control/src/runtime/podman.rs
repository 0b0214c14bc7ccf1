//! Podman container runtime.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cirrus_build::process::run_captured;
use cirrus_build::ImageRef;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use super::{IsolatedRuntime, RunLimits, RunOutcome, RunOutput};
use crate::config::RuntimeConfig;
use crate::error::{ControlError, ControlResult};

/// Time allowed for `podman kill` after an invocation times out.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs each invocation in a fresh `podman run --rm` container.
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    config: RuntimeConfig,
}

impl PodmanRuntime {
    /// Create a new Podman runtime.
    #[must_use]
    pub const fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Arguments for `podman run`.
    fn run_args(&self, name: &str, image: &ImageRef, limits: &RunLimits) -> Vec<String> {
        vec![
            "run".to_owned(),
            "--rm".to_owned(),
            "--interactive".to_owned(),
            "--name".to_owned(),
            name.to_owned(),
            "--network".to_owned(),
            self.config.network.clone(),
            "--memory".to_owned(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".to_owned(),
            format!("{}m", limits.memory_swap_mb),
            "--cpus".to_owned(),
            limits.cpus.to_string(),
            image.reference.clone(),
        ]
    }
}

/// Kills its container unless disarmed.
///
/// The kill runs on a detached task, so it completes even when the future
/// driving the invocation is dropped by a caller's deadline.
struct ContainerGuard {
    binary: String,
    signal: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(config: &RuntimeConfig, name: &str) -> Self {
        Self {
            binary: config.binary.clone(),
            signal: config.kill_signal.clone(),
            name: name.to_owned(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Spawn `podman kill` once.
    fn kill(&mut self) {
        if !std::mem::replace(&mut self.armed, false) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.name, "no runtime available to kill container");
            return;
        };

        let mut cmd = TokioCommand::new(&self.binary);
        cmd.args(["kill", "--signal", self.signal.as_str(), self.name.as_str()]);
        let name = self.name.clone();

        handle.spawn(async move {
            match run_captured(cmd, None, KILL_TIMEOUT).await {
                Ok(out) if out.success() => debug!(container = %name, "container killed"),
                Ok(out) => debug!(
                    container = %name,
                    stderr = %out.stderr_text(),
                    "podman kill failed (container may have exited)"
                ),
                Err(e) => warn!(container = %name, error = %e, "failed to run podman kill"),
            }
        });
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[async_trait]
impl IsolatedRuntime for PodmanRuntime {
    async fn run(
        &self,
        image: &ImageRef,
        input: Bytes,
        limits: &RunLimits,
    ) -> ControlResult<RunOutput> {
        let name = format!("cirrus-{}", ulid::Ulid::new().to_string().to_lowercase());

        let mut cmd = TokioCommand::new(&self.config.binary);
        cmd.args(self.run_args(&name, image, limits));

        debug!(image = %image.reference, container = %name, "starting container");

        let mut guard = ContainerGuard::new(&self.config, &name);
        let out = match run_captured(cmd, Some(input.to_vec()), limits.timeout).await {
            Ok(out) => out,
            Err(e) => {
                guard.disarm();
                return Err(ControlError::ExecutionRuntime(format!(
                    "failed to start {}: {e}",
                    self.config.binary
                )));
            }
        };

        if out.timed_out {
            guard.kill();
        } else {
            guard.disarm();
        }

        let output = RunOutput::from_process(
            out.stdout,
            out.stderr,
            out.exit_code,
            out.timed_out,
            out.duration,
        );

        match &output.outcome {
            RunOutcome::Timeout => info!(
                container = %name,
                limit_ms = limits.timeout.as_millis(),
                "container killed after time limit"
            ),
            RunOutcome::Error(message) => {
                debug!(container = %name, error = %message, "function returned error");
            }
            RunOutcome::Success(_) => debug!(
                container = %name,
                duration_ms = output.duration.as_millis(),
                "container finished"
            ),
        }

        Ok(output)
    }
}
