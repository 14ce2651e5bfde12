//! Implementation step: code generation plus post-generation validation.
//!
//! Code generation is delegated to an external agent command run through
//! `sh -c`. The story prompt goes to its stdin and `STORY_PATH`, `STORY_ID`
//! and `ITERATION` are set in its environment. Modified files are found by
//! comparing modification times of the Python files under the watched
//! directories before and after the command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Outcome, PhaseAgent, PhaseReport, StoryTask};
use crate::process::{CommandRunner, CommandSpec, OutputLine, OutputStream, ToolError};
use crate::scheduler::is_test_file;
use crate::story::Phase;
use crate::timeout::TimeoutConfig;
use crate::tools::{TestRunIntegrator, TestRunOptions, TestRunStatus, TestRunSummary};

/// Lines buffered between the agent command and the log forwarder.
const STREAM_BUFFER: usize = 256;

type Snapshot = BTreeMap<PathBuf, SystemTime>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImplementationSummary {
    pub modified_files: Vec<PathBuf>,
    pub agent_invoked: bool,
    pub agent_exit_code: Option<i32>,
    /// `path: reason` for each modified file that failed to compile
    pub compile_failures: Vec<String>,
    /// Runner result for the modified test files, if any were run
    pub focused_tests: Option<TestRunSummary>,
    pub notes: Vec<String>,
}

/// Modification times of every `*.py` file under `dirs`.
fn snapshot(dirs: &[PathBuf]) -> Snapshot {
    let mut files = Snapshot::new();
    for dir in dirs {
        let pattern = format!("{}/**/*.py", glob::Pattern::escape(&dir.display().to_string()));
        let Ok(paths) = glob::glob(&pattern) else {
            continue;
        };
        for path in paths.flatten() {
            if let Ok(modified) = path.metadata().and_then(|m| m.modified()) {
                files.insert(path, modified);
            }
        }
    }
    files
}

/// Files that are new in `after` or whose modification time changed.
fn changed_files(before: &Snapshot, after: &Snapshot) -> Vec<PathBuf> {
    after
        .iter()
        .filter(|(path, modified)| before.get(*path) != Some(*modified))
        .map(|(path, _)| path.clone())
        .collect()
}

fn story_prompt(task: &StoryTask, story: &str) -> String {
    let mut prompt = format!("Implement story {}", task.story_id);
    if !task.title.is_empty() {
        prompt.push_str(": ");
        prompt.push_str(&task.title);
    }
    prompt.push_str(&format!(
        "\n\nStory file: {}\nIteration: {}\n\n{}",
        task.story_path.display(),
        task.iteration,
        story
    ));
    prompt
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// Drives code generation for a story and validates the result.
#[derive(Clone)]
pub struct ImplementationAgent {
    runner: Arc<dyn CommandRunner>,
    watch_dirs: Vec<PathBuf>,
    agent_command: Option<String>,
    python: String,
    test_runner: Option<TestRunIntegrator>,
    validate: bool,
    agent_timeout: Duration,
    validation_timeout: Duration,
}

impl ImplementationAgent {
    pub fn new(runner: Arc<dyn CommandRunner>, watch_dirs: Vec<PathBuf>) -> Self {
        let timeouts = TimeoutConfig::default();
        Self {
            runner,
            watch_dirs,
            agent_command: None,
            python: "python3".to_string(),
            test_runner: None,
            validate: true,
            agent_timeout: timeouts.agent_timeout,
            validation_timeout: timeouts.validation_timeout,
        }
    }

    /// Shell command that generates the code.
    pub fn with_agent_command(mut self, command: impl Into<String>) -> Self {
        self.agent_command = Some(command.into());
        self
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Runner used for the focused test run over modified test files.
    pub fn with_test_runner(mut self, runner: TestRunIntegrator) -> Self {
        self.test_runner = Some(runner);
        self
    }

    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_timeouts(mut self, agent: Duration, validation: Duration) -> Self {
        self.agent_timeout = agent;
        self.validation_timeout = validation;
        self
    }

    async fn snapshot(&self) -> Snapshot {
        let dirs = self.watch_dirs.clone();
        tokio::task::spawn_blocking(move || snapshot(&dirs))
            .await
            .unwrap_or_default()
    }

    /// Run the agent command, forwarding its output to the log.
    async fn generate(
        &self,
        command: &str,
        task: &StoryTask,
        story: &str,
        summary: &mut ImplementationSummary,
    ) -> Result<(), String> {
        let spec = CommandSpec::new("sh", self.agent_timeout)
            .arg("-c")
            .arg(command)
            .stdin(story_prompt(task, story))
            .env("STORY_PATH", task.story_path.display().to_string())
            .env("STORY_ID", &task.story_id)
            .env("ITERATION", task.iteration.to_string());

        let (tx, mut rx) = mpsc::channel::<OutputLine>(STREAM_BUFFER);
        let story_id = task.story_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(OutputLine { stream, line }) = rx.recv().await {
                match stream {
                    OutputStream::Stdout => debug!(story = %story_id, "agent: {line}"),
                    OutputStream::Stderr => debug!(story = %story_id, "agent stderr: {line}"),
                }
            }
        });

        let result = self.runner.run_streaming(&spec, tx).await;
        let _ = forwarder.await;
        summary.agent_invoked = true;

        match result {
            Ok(output) if output.success() => {
                summary.agent_exit_code = output.exit_code;
                Ok(())
            }
            Ok(output) => {
                summary.agent_exit_code = output.exit_code;
                let detail = last_line(&output.stderr);
                Err(if detail.is_empty() {
                    format!("agent command exited with {:?}", output.exit_code)
                } else {
                    format!("agent command exited with {:?}: {detail}", output.exit_code)
                })
            }
            Err(err) => Err(format!("agent command failed: {err}")),
        }
    }

    /// `python -m py_compile` over each modified Python file.
    async fn compile_check(&self, files: &[PathBuf], summary: &mut ImplementationSummary) {
        for file in files.iter().filter(|f| f.extension().is_some_and(|e| e == "py")) {
            let spec = CommandSpec::new(&self.python, self.validation_timeout)
                .args(["-m", "py_compile"])
                .arg(file.display().to_string());
            match self.runner.run(&spec).await {
                Ok(output) if output.success() => {}
                Ok(output) => summary
                    .compile_failures
                    .push(format!("{}: {}", file.display(), last_line(&output.stderr))),
                Err(ToolError::NotFound { program }) => {
                    summary
                        .notes
                        .push(format!("{program} not available; compile check skipped"));
                    return;
                }
                Err(err) => summary
                    .compile_failures
                    .push(format!("{}: {err}", file.display())),
            }
        }
    }

    /// Run the modified test files on their own.
    async fn focused_tests(&self, files: &[PathBuf], summary: &mut ImplementationSummary) {
        let Some(runner) = &self.test_runner else {
            return;
        };
        let targets: Vec<PathBuf> = files
            .iter()
            .filter(|f| f.file_name().and_then(|n| n.to_str()).is_some_and(is_test_file))
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        let result = runner
            .run(&TestRunOptions::new(targets, self.validation_timeout))
            .await;
        if result.status == TestRunStatus::ToolMissing {
            summary
                .notes
                .push("test runner not available; focused tests skipped".to_string());
        }
        summary.focused_tests = Some(result);
    }

    async fn implement(&self, task: &StoryTask) -> (ImplementationSummary, Result<(), String>) {
        let mut summary = ImplementationSummary::default();
        let story = match read_story(&task.story_path).await {
            Ok(story) => story,
            Err(err) => return (summary, Err(err)),
        };

        let Some(command) = &self.agent_command else {
            summary
                .notes
                .push("no agent command configured; no code generated".to_string());
            return (summary, Ok(()));
        };

        let before = self.snapshot().await;
        let generated = self.generate(command, task, &story, &mut summary).await;
        let after = self.snapshot().await;
        summary.modified_files = changed_files(&before, &after);
        if let Err(err) = generated {
            return (summary, Err(err));
        }

        if self.validate && !summary.modified_files.is_empty() {
            let files = summary.modified_files.clone();
            self.compile_check(&files, &mut summary).await;
            if !summary.compile_failures.is_empty() {
                let reason = format!(
                    "{} modified files failed to compile",
                    summary.compile_failures.len()
                );
                return (summary, Err(reason));
            }
            self.focused_tests(&files, &mut summary).await;
            if let Some(tests) = &summary.focused_tests {
                if !tests.is_passing() && tests.status != TestRunStatus::ToolMissing {
                    let reason = format!(
                        "focused tests failed: {} failing ({:?})",
                        tests.failing_count(),
                        tests.status
                    );
                    return (summary, Err(reason));
                }
            }
        }
        (summary, Ok(()))
    }
}

async fn read_story(path: &Path) -> Result<String, String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| format!("failed to read story {}: {err}", path.display()))
}

#[async_trait]
impl PhaseAgent for ImplementationAgent {
    fn phase(&self) -> Phase {
        Phase::Impl
    }

    async fn execute(&self, task: &StoryTask) -> Outcome {
        let (summary, result) = self.implement(task).await;
        info!(
            story = %task.story_id,
            iteration = task.iteration,
            modified = summary.modified_files.len(),
            agent = summary.agent_invoked,
            "implementation finished"
        );
        match result {
            Ok(()) => Outcome::success(PhaseReport::Implementation(summary)),
            Err(reason) => {
                warn!(story = %task.story_id, error = %reason, "implementation failed");
                Outcome::failure(PhaseReport::Implementation(summary), reason)
            }
        }
    }
}
