//! Test runner integration.
//!
//! The scheduler decides the options; this module turns them into a command
//! line and scrapes the runner's summary line (`3 failed, 10 passed, 1 error
//! in 2.31s`) and its short-summary `FAILED path::test - reason` lines.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::diagnostic::absolute_path_string;
use super::stderr_tail;
use crate::process::{CommandRunner, CommandSpec, ToolError};

/// Runner exit code for "no tests collected".
pub const EXIT_NO_TESTS: i32 = 5;

/// Parallel worker count passed to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerCount {
    Auto,
    Fixed(u32),
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCount::Auto => f.write_str("auto"),
            WorkerCount::Fixed(n) => write!(f, "{n}"),
        }
    }
}

/// Options for one runner invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunOptions {
    /// Directories or files to run
    pub targets: Vec<PathBuf>,
    pub verbose: bool,
    /// `-n <workers>` when set
    pub workers: Option<WorkerCount>,
    /// `--cov=<dir> --cov-report=term-missing` when set
    pub coverage_source: Option<PathBuf>,
    /// `--maxfail=<n>` when set
    pub max_fail: Option<u32>,
    pub timeout: Duration,
}

impl TestRunOptions {
    pub fn new(targets: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            targets,
            verbose: false,
            workers: None,
            coverage_source: None,
            max_fail: None,
            timeout,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_workers(mut self, workers: WorkerCount) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_coverage(mut self, source: impl Into<PathBuf>) -> Self {
        self.coverage_source = Some(source.into());
        self
    }

    pub fn with_max_fail(mut self, max_fail: u32) -> Self {
        self.max_fail = Some(max_fail);
        self
    }
}

/// Outcome category of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunStatus {
    Passed,
    /// Nothing was collected; counts as passing
    NoTests,
    Failed,
    TimedOut,
    ToolMissing,
    /// Interrupted, internal error or usage error
    ToolError,
}

/// One failing test from the short summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Absolute test file path
    pub file: String,
    /// Test node id within the file, if reported
    pub test: Option<String>,
    pub reason: String,
}

/// Parsed result of a runner invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunSummary {
    pub status: TestRunStatus,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
    pub exit_code: Option<i32>,
    pub failures: Vec<TestFailure>,
    pub elapsed: Duration,
    pub message: Option<String>,
}

impl TestRunSummary {
    fn without_output(status: TestRunStatus, message: String) -> Self {
        Self {
            status,
            passed: 0,
            failed: 0,
            errors: 0,
            skipped: 0,
            exit_code: None,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
            message: Some(message),
        }
    }

    pub fn is_passing(&self) -> bool {
        matches!(self.status, TestRunStatus::Passed | TestRunStatus::NoTests)
    }

    /// Failed plus errored tests.
    pub fn failing_count(&self) -> u32 {
        self.failed + self.errors
    }

    /// Failing tests per file.
    pub fn failures_by_file(&self) -> BTreeMap<String, Vec<&TestFailure>> {
        let mut by_file: BTreeMap<String, Vec<&TestFailure>> = BTreeMap::new();
        for failure in &self.failures {
            by_file.entry(failure.file.clone()).or_default().push(failure);
        }
        by_file
    }
}

/// Counts scraped from the summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
}

fn count_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+(passed|failed|errors?|skipped)\b").ok())
        .as_ref()
}

fn failure_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:FAILED|ERROR)\s+([^\s:]+)(?:::(\S+))?(?:\s+-\s+(.*))?$").ok()
    })
    .as_ref()
}

/// Scrape pass/fail counts from the last summary line in `output`.
pub fn parse_summary(output: &str) -> SummaryCounts {
    let Some(re) = count_re() else {
        return SummaryCounts::default();
    };

    let summary_line = output
        .lines()
        .rev()
        .find(|line| line.contains(" in ") && re.is_match(line));

    let mut counts = SummaryCounts::default();
    if let Some(line) = summary_line {
        for caps in re.captures_iter(line) {
            let value: u32 = caps[1].parse().unwrap_or(0);
            match &caps[2] {
                "passed" => counts.passed = value,
                "failed" => counts.failed = value,
                "error" | "errors" => counts.errors = value,
                "skipped" => counts.skipped = value,
                _ => {}
            }
        }
    }
    counts
}

/// Extract `FAILED`/`ERROR` short-summary lines.
pub fn parse_failures(output: &str, base_dir: &Path) -> Vec<TestFailure> {
    let Some(re) = failure_re() else {
        return Vec::new();
    };
    output
        .lines()
        .filter_map(|line| re.captures(line.trim_end()))
        .map(|caps| TestFailure {
            file: absolute_path_string(&caps[1], base_dir),
            test: caps.get(2).map(|m| m.as_str().to_string()),
            reason: caps
                .get(3)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
        .collect()
}

/// Invokes the test runner.
#[derive(Clone)]
pub struct TestRunIntegrator {
    runner: Arc<dyn CommandRunner>,
    program: String,
    cwd: Option<PathBuf>,
}

impl TestRunIntegrator {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn build_command(&self, options: &TestRunOptions) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program, options.timeout)
            .args(options.targets.iter().map(|t| t.display().to_string()));
        if options.verbose {
            spec = spec.arg("-v");
        }
        if let Some(workers) = options.workers {
            spec = spec.arg("-n").arg(workers.to_string());
        }
        if let Some(source) = &options.coverage_source {
            spec = spec
                .arg(format!("--cov={}", source.display()))
                .arg("--cov-report=term-missing");
        }
        if let Some(max_fail) = options.max_fail {
            spec = spec.arg(format!("--maxfail={max_fail}"));
        }
        if let Some(cwd) = &self.cwd {
            spec = spec.current_dir(cwd);
        }
        spec
    }

    /// Run the tests described by `options`. Never fails.
    pub async fn run(&self, options: &TestRunOptions) -> TestRunSummary {
        let spec = self.build_command(options);
        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(err) => {
                let status = match &err {
                    ToolError::NotFound { .. } => TestRunStatus::ToolMissing,
                    ToolError::Timeout { .. } => TestRunStatus::TimedOut,
                    ToolError::Io { .. } => TestRunStatus::ToolError,
                };
                warn!(tool = %self.program, error = %err, "test run did not complete");
                return TestRunSummary::without_output(status, err.to_string());
            }
        };

        let base_dir = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir().unwrap_or_default(),
        };
        let counts = parse_summary(&output.stdout);
        let failures = parse_failures(&output.stdout, &base_dir);

        let status = match output.exit_code {
            Some(0) => TestRunStatus::Passed,
            Some(EXIT_NO_TESTS) => TestRunStatus::NoTests,
            Some(1) => TestRunStatus::Failed,
            _ => TestRunStatus::ToolError,
        };
        let message = match status {
            TestRunStatus::ToolError => Some(format!(
                "test runner exited with {:?}: {}",
                output.exit_code,
                stderr_tail(&output.stderr)
            )),
            _ => None,
        };

        debug!(
            tool = %self.program,
            ?status,
            passed = counts.passed,
            failed = counts.failed,
            errors = counts.errors,
            "test run finished"
        );
        TestRunSummary {
            status,
            passed: counts.passed,
            failed: counts.failed,
            errors: counts.errors,
            skipped: counts.skipped,
            exit_code: output.exit_code,
            failures,
            elapsed: output.elapsed,
            message,
        }
    }
}
