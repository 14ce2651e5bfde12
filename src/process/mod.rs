//! Subprocess adapter.
//!
//! [`CommandRunner`] is the seam between the integrators and the operating
//! system. [`ProcessRunner`] is the real implementation: it spawns the
//! program in its own process group, drains stdout and stderr concurrently
//! with waiting (a full pipe buffer would otherwise block the child), and
//! enforces the command timeout in-process.

pub mod group;
#[cfg(test)]
pub(crate) mod testing;

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use group::ProcessGroupGuard;

/// Time allowed to collect remaining pipe output after the child exits.
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum bytes kept per stream (10MB).
const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Errors launching or waiting on an external tool.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The executable is not on the path.
    #[error("tool not found: {program}")]
    NotFound { program: String },

    /// The command exceeded its timeout and its process group was killed.
    #[error("{program} timed out after {timeout_secs}s")]
    Timeout {
        program: String,
        timeout_secs: u64,
        /// Output captured before the kill
        stdout: String,
        stderr: String,
    },

    /// Spawning, piping or waiting failed.
    #[error("I/O error running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ToolError::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }
}

/// A command to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout,
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program and arguments joined for log output.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a completed command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// `None` when the child was ended by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Which pipe a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of streamed output, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Launches external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture all output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError>;

    /// Run to completion, forwarding each output line to `lines` as it is
    /// produced. The full output is still returned.
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<CommandOutput, ToolError> {
        let output = self.run(spec).await?;
        for line in output.stdout.lines() {
            let _ = lines
                .send(OutputLine {
                    stream: OutputStream::Stdout,
                    line: line.to_string(),
                })
                .await;
        }
        for line in output.stderr.lines() {
            let _ = lines
                .send(OutputLine {
                    stream: OutputStream::Stderr,
                    line: line.to_string(),
                })
                .await;
        }
        Ok(output)
    }
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessRunner {
    /// `kill_grace` is the pause between SIGTERM and SIGKILL on timeout.
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    async fn execute(
        &self,
        spec: &CommandSpec,
        lines: Option<mpsc::Sender<OutputLine>>,
    ) -> Result<CommandOutput, ToolError> {
        let program = spec.program.clone();
        let io_error = |source: io::Error| ToolError::Io {
            program: program.clone(),
            source,
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            // Spawn reports a missing cwd as NotFound, which would read as a missing tool.
            if !dir.is_dir() {
                return Err(io_error(io::Error::new(
                    io::ErrorKind::Other,
                    format!("working directory {} does not exist", dir.display()),
                )));
            }
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            command = %spec.display(),
            timeout_secs = spec.timeout.as_secs(),
            "launching command"
        );
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ToolError::NotFound {
                    program: program.clone(),
                }
            } else {
                io_error(err)
            }
        })?;
        let mut group = ProcessGroupGuard::new(child.id(), self.kill_grace);

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is expected then.
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout_task = tokio::spawn(drain(
            child.stdout.take(),
            OutputStream::Stdout,
            lines.clone(),
        ));
        let stderr_task = tokio::spawn(drain(child.stderr.take(), OutputStream::Stderr, lines));

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => Some(status.map_err(io_error)?),
            Err(_) => {
                warn!(
                    program = %spec.program,
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out, killing process group"
                );
                self.terminate(&mut child, &group).await;
                None
            }
        };
        group.disarm();

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        let elapsed = started.elapsed();

        match status {
            Some(status) => {
                debug!(
                    program = %spec.program,
                    exit_code = ?status.code(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "command finished"
                );
                Ok(CommandOutput {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    elapsed,
                })
            }
            None => Err(ToolError::Timeout {
                program,
                timeout_secs: spec.timeout.as_secs(),
                stdout,
                stderr,
            }),
        }
    }

    /// SIGTERM the group, wait out the grace, then SIGKILL whatever is left.
    async fn terminate(&self, child: &mut Child, group: &ProcessGroupGuard) {
        group.terminate();
        if tokio::time::timeout(self.kill_grace, child.wait())
            .await
            .is_err()
        {
            let _ = child.start_kill();
        }
        // Grandchildren may outlive the leader.
        group.kill();
        let _ = child.wait().await;
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
        self.execute(spec, None).await
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<CommandOutput, ToolError> {
        self.execute(spec, Some(lines)).await
    }
}

async fn drain<R>(
    reader: Option<R>,
    stream: OutputStream,
    lines: Option<mpsc::Sender<OutputLine>>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader);
    let mut captured = Vec::new();
    let mut line = Vec::new();
    let mut truncated = false;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if captured.len() + line.len() <= MAX_OUTPUT_SIZE {
                    captured.extend_from_slice(&line);
                } else {
                    truncated = true;
                }
                if let Some(tx) = &lines {
                    let text = String::from_utf8_lossy(&line)
                        .trim_end_matches(|c: char| c == '\n' || c == '\r')
                        .to_string();
                    let _ = tx.send(OutputLine { stream, line: text }).await;
                }
            }
            Err(_) => break,
        }
    }

    if truncated {
        captured.extend_from_slice(b"\n[output truncated at 10MB]");
    }
    String::from_utf8_lossy(&captured).into_owned()
}

async fn collect(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_COLLECTION_TIMEOUT, &mut task).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => "[error reading output]".to_string(),
        Err(_) => {
            task.abort();
            "[output collection timed out]".to_string()
        }
    }
}
