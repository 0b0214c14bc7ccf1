//! Isolated function runtimes.
//!
//! A runtime starts one instance of a function image per invocation, feeds
//! it the JSON payload on stdin and collects the envelope line the
//! bootstrap writes to stdout. The Podman implementation runs containers
//! with resource ceilings; [`MockRuntime`] evaluates a closure in-process
//! for tests.

mod podman;

pub use podman::PodmanRuntime;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use cirrus_build::ImageRef;
use serde_json::Value;

use crate::config::{RuntimeConfig, RuntimeType};
use crate::error::{ControlError, ControlResult};

/// Resource ceilings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    /// Wall-clock limit; the instance is killed when it expires.
    pub timeout: Duration,
    /// Memory ceiling in MiB.
    pub memory_mb: u32,
    /// Memory plus swap ceiling in MiB.
    pub memory_swap_mb: u32,
    /// CPU quota.
    pub cpus: f64,
}

impl RunLimits {
    /// Limits taken from the runtime configuration.
    #[must_use]
    pub const fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            timeout: config.timeout(),
            memory_mb: config.memory_mb,
            memory_swap_mb: config.memory_swap_mb,
            cpus: config.cpus,
        }
    }
}

/// What an invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The handler returned a value.
    Success(Value),
    /// The handler or the instance reported an error.
    Error(String),
    /// The time limit expired and the instance was killed.
    Timeout,
}

/// Output of one isolated run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Stdout lines, including the envelope.
    pub stdout: Vec<String>,
    /// Stderr lines.
    pub stderr: Vec<String>,
    /// Exit code, if the instance exited on its own.
    pub exit_code: Option<i32>,
    /// Interpreted result.
    pub outcome: RunOutcome,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl RunOutput {
    /// Interpret captured process output.
    ///
    /// The last stdout line that parses as an envelope object decides the
    /// outcome. A missing envelope is an error that carries the exit code.
    #[must_use]
    pub fn from_process(
        stdout: Vec<String>,
        stderr: Vec<String>,
        exit_code: Option<i32>,
        timed_out: bool,
        duration: Duration,
    ) -> Self {
        let outcome = if timed_out {
            RunOutcome::Timeout
        } else {
            match find_envelope(&stdout) {
                Some((_, outcome)) => outcome,
                None => RunOutcome::Error(match exit_code {
                    Some(code) => format!("function exited with code {code} without a result"),
                    None => "function terminated by signal".to_owned(),
                }),
            }
        };

        Self {
            stdout,
            stderr,
            exit_code,
            outcome,
            duration,
        }
    }

    /// Log lines: stdout other than the envelope, then stderr.
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        let envelope = find_envelope(&self.stdout).map(|(index, _)| index);
        self.stdout
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != envelope)
            .map(|(_, line)| line.clone())
            .chain(self.stderr.iter().cloned())
            .collect()
    }
}

fn find_envelope(stdout: &[String]) -> Option<(usize, RunOutcome)> {
    stdout
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, line)| parse_envelope(line).map(|outcome| (i, outcome)))
}

/// Parse one `{"result": ..}` or `{"error": ..}` line.
fn parse_envelope(line: &str) -> Option<RunOutcome> {
    let Value::Object(mut map) = serde_json::from_str::<Value>(line.trim()).ok()? else {
        return None;
    };
    if map.len() != 1 {
        return None;
    }
    if let Some(result) = map.remove("result") {
        return Some(RunOutcome::Success(result));
    }
    match map.remove("error")? {
        Value::String(message) => Some(RunOutcome::Error(message)),
        other => Some(RunOutcome::Error(other.to_string())),
    }
}

/// Trait for isolated runtime backends.
#[async_trait]
pub trait IsolatedRuntime: Send + Sync {
    /// Run `image` once with `input` on stdin.
    ///
    /// Handler failures and timeouts are reported through
    /// [`RunOutput::outcome`]. An `Err` means the instance could not be
    /// started at all. Dropping the returned future must still terminate
    /// the instance.
    async fn run(&self, image: &ImageRef, input: Bytes, limits: &RunLimits)
        -> ControlResult<RunOutput>;
}

/// Create a runtime from configuration.
pub fn create_runtime(config: &RuntimeConfig) -> ControlResult<Arc<dyn IsolatedRuntime>> {
    match config.runtime_type {
        RuntimeType::Podman => Ok(Arc::new(PodmanRuntime::new(config.clone()))),
        RuntimeType::Mock => Ok(Arc::new(MockRuntime::new())),
    }
}

type MockHandler = dyn Fn(&ImageRef, Value) -> Result<Value, String> + Send + Sync;

/// In-process runtime for testing.
///
/// The handler closure stands in for the function image. The default
/// handler echoes its input.
pub struct MockRuntime {
    handler: Arc<MockHandler>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockRuntime {
    /// Create a runtime that echoes its input.
    #[must_use]
    pub fn new() -> Self {
        Self::with_handler(|_, input| Ok(input))
    }

    /// Create a runtime that evaluates `handler`.
    #[must_use]
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ImageRef, Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep for `delay` before answering.
    #[must_use]
    pub const fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of runs started.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Largest number of runs observed in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRuntime")
            .field("delay", &self.delay)
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IsolatedRuntime for MockRuntime {
    async fn run(
        &self,
        image: &ImageRef,
        input: Bytes,
        limits: &RunLimits,
    ) -> ControlResult<RunOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let start = Instant::now();
        if let Some(delay) = self.delay {
            if delay > limits.timeout {
                tokio::time::sleep(limits.timeout).await;
                return Ok(RunOutput::from_process(
                    Vec::new(),
                    Vec::new(),
                    None,
                    true,
                    start.elapsed(),
                ));
            }
            tokio::time::sleep(delay).await;
        }

        let input: Value = if input.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&input)
                .map_err(|e| ControlError::ExecutionRuntime(format!("invalid input: {e}")))?
        };

        let (envelope, exit_code) = match (self.handler)(image, input) {
            Ok(result) => (serde_json::json!({ "result": result }), 0),
            Err(message) => (serde_json::json!({ "error": message }), 1),
        };

        Ok(RunOutput::from_process(
            vec![envelope.to_string()],
            vec![format!("mock run of {}", image.reference)],
            Some(exit_code),
            false,
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ImageRef {
        ImageRef {
            tag: "f-v1".to_owned(),
            reference: "mock/f-v1".to_owned(),
        }
    }

    fn limits(timeout: Duration) -> RunLimits {
        RunLimits {
            timeout,
            ..RunLimits::from_config(&RuntimeConfig::default())
        }
    }

    #[test]
    fn result_envelope_is_success() {
        let out = RunOutput::from_process(
            vec!["starting".to_owned(), r#"{"result":{"n":1}}"#.to_owned()],
            vec!["warn".to_owned()],
            Some(0),
            false,
            Duration::ZERO,
        );
        assert_eq!(out.outcome, RunOutcome::Success(serde_json::json!({"n": 1})));
        assert_eq!(out.logs(), vec!["starting".to_owned(), "warn".to_owned()]);
    }

    #[test]
    fn error_envelope_is_error() {
        let out = RunOutput::from_process(
            vec![r#"{"error":"bad input"}"#.to_owned()],
            Vec::new(),
            Some(1),
            false,
            Duration::ZERO,
        );
        assert_eq!(out.outcome, RunOutcome::Error("bad input".to_owned()));
    }

    #[test]
    fn missing_envelope_reports_exit_code() {
        let out = RunOutput::from_process(
            vec!["{\"other\":1}".to_owned(), "not json".to_owned()],
            Vec::new(),
            Some(101),
            false,
            Duration::ZERO,
        );
        match &out.outcome {
            RunOutcome::Error(message) => assert!(message.contains("101")),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(out.logs().len(), 2);
    }

    #[test]
    fn timeout_wins_over_output() {
        let out = RunOutput::from_process(
            vec![r#"{"result":1}"#.to_owned()],
            Vec::new(),
            None,
            true,
            Duration::ZERO,
        );
        assert_eq!(out.outcome, RunOutcome::Timeout);
    }

    #[tokio::test]
    async fn mock_echoes_input() {
        let runtime = MockRuntime::new();
        let out = runtime
            .run(&image(), Bytes::from_static(b"{\"a\":1}"), &limits(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(out.outcome, RunOutcome::Success(serde_json::json!({"a": 1})));
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(runtime.call_count(), 1);
    }

    #[tokio::test]
    async fn mock_handler_error() {
        let runtime = MockRuntime::with_handler(|_, _| Err("boom".to_owned()));
        let out = runtime
            .run(&image(), Bytes::new(), &limits(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(out.outcome, RunOutcome::Error("boom".to_owned()));
        assert_eq!(out.exit_code, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_delay_beyond_limit_times_out() {
        let runtime = MockRuntime::new().delayed(Duration::from_secs(10));
        let out = runtime
            .run(&image(), Bytes::new(), &limits(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(out.outcome, RunOutcome::Timeout);
        assert_eq!(out.exit_code, None);
    }
}
