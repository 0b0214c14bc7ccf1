//! Child process execution with captured output and a hard time limit.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long to wait for output readers after a killed child.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bytes of output kept per stream. Older lines are dropped first so the
/// final lines survive.
pub const MAX_CAPTURED_BYTES: usize = 4 * 1024 * 1024;

/// Output of a child process.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    /// Exit code, or `None` if the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    /// Whether the time limit expired and the process was killed.
    pub timed_out: bool,
    /// Stdout lines, at most [`MAX_CAPTURED_BYTES`] of them.
    pub stdout: Vec<String>,
    /// Stderr lines, at most [`MAX_CAPTURED_BYTES`] of them.
    pub stderr: Vec<String>,
    /// Wall-clock time from spawn to exit or kill.
    pub duration: Duration,
}

impl CapturedOutput {
    /// Whether the process exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr joined into one string.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Run `cmd` to completion, feeding it `stdin` and killing it after `limit`.
///
/// Returns an error only if the process could not be spawned or waited on.
/// A timeout is reported through [`CapturedOutput::timed_out`] together with
/// whatever output was produced before the kill.
pub async fn run_captured(
    mut cmd: TokioCommand,
    stdin: Option<Vec<u8>>,
    limit: Duration,
) -> std::io::Result<CapturedOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&input).await {
                debug!(error = %e, "child closed stdin early");
            }
        });
    }

    let stdout_task = child
        .stdout
        .take()
        .map(|s| collect_lines(BufReader::new(s), MAX_CAPTURED_BYTES));
    let stderr_task = child
        .stderr
        .take()
        .map(|s| collect_lines(BufReader::new(s), MAX_CAPTURED_BYTES));

    let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!(limit_ms = limit.as_millis(), "process exceeded time limit, killing");
            child.kill().await.ok();
            (None, true)
        }
    };
    let duration = start.elapsed();

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;

    Ok(CapturedOutput {
        exit_code,
        timed_out,
        stdout,
        stderr,
        duration,
    })
}

/// Lines read from one stream, keeping the newest `limit` bytes.
#[derive(Debug)]
struct LineBuffer {
    lines: VecDeque<String>,
    current: Vec<u8>,
    bytes: usize,
    limit: usize,
    dropped_lines: usize,
    clipped: bool,
}

impl LineBuffer {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            current: Vec::new(),
            bytes: 0,
            limit,
            dropped_lines: 0,
            clipped: false,
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.current.len());
        if chunk.len() > room {
            self.clipped = true;
        }
        self.current.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn end_line(&mut self) {
        let mut raw = std::mem::take(&mut self.current);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let line = String::from_utf8_lossy(&raw).into_owned();

        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
                self.dropped_lines += 1;
            }
        }
    }

    fn finish(mut self) -> Vec<String> {
        if !self.current.is_empty() {
            self.end_line();
        }
        let mut lines = Vec::with_capacity(self.lines.len() + 1);
        if self.dropped_lines > 0 || self.clipped {
            lines.push(format!(
                "[output truncated: {} earlier lines dropped, limit {} bytes]",
                self.dropped_lines, self.limit
            ));
        }
        lines.extend(self.lines);
        lines
    }
}

/// Read `reader` to the end on a task, keeping at most `limit` bytes.
///
/// The stream is always read to EOF so a chatty child never blocks on a
/// full pipe.
fn collect_lines<R>(mut reader: R, limit: usize) -> JoinHandle<Vec<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = LineBuffer::new(limit);
        loop {
            let chunk = match reader.fill_buf().await {
                Ok([]) | Err(_) => break,
                Ok(chunk) => chunk,
            };
            let consumed = match chunk.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    buffer.extend(&chunk[..end]);
                    buffer.end_line();
                    end + 1
                }
                None => {
                    buffer.extend(chunk);
                    chunk.len()
                }
            };
            reader.consume(consumed);
        }
        buffer.finish()
    })
}

async fn drain(task: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(_)) | Err(_) => Vec::new(),
    }
}
