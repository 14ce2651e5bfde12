//! Test batch configuration and results.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tools::{TestFailure, TestRunStatus, TestRunSummary, WorkerCount};

/// Name of the synthetic batch holding test files directly under the root.
pub const LOOSE_TESTS_BATCH: &str = "loose_tests";

/// Execution settings matched from a directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRule {
    /// Matched against the whole lower-cased directory name
    pub pattern: &'static str,
    pub timeout_secs: u64,
    /// Worker count when the batch runs in parallel
    pub workers: Option<WorkerCount>,
    pub blocking: bool,
    pub priority: u8,
}

/// Checked in order; the first match wins.
pub const BATCH_RULES: &[BatchRule] = &[
    BatchRule {
        pattern: ".*smoke.*",
        timeout_secs: 30,
        workers: None,
        blocking: true,
        priority: 1,
    },
    BatchRule {
        pattern: ".*unit.*",
        timeout_secs: 60,
        workers: Some(WorkerCount::Auto),
        blocking: true,
        priority: 2,
    },
    BatchRule {
        pattern: ".*(integration|api).*",
        timeout_secs: 120,
        workers: Some(WorkerCount::Fixed(2)),
        blocking: true,
        priority: 3,
    },
    BatchRule {
        pattern: ".*(e2e|end.*end).*",
        timeout_secs: 600,
        workers: None,
        blocking: false,
        priority: 4,
    },
    BatchRule {
        pattern: ".*(gui|ui).*",
        timeout_secs: 300,
        workers: None,
        blocking: false,
        priority: 4,
    },
    BatchRule {
        pattern: ".*(perf|performance).*",
        timeout_secs: 600,
        workers: None,
        blocking: false,
        priority: 5,
    },
];

/// Applied when no rule matches.
pub const DEFAULT_RULE: BatchRule = BatchRule {
    pattern: ".*",
    timeout_secs: 120,
    workers: Some(WorkerCount::Auto),
    blocking: true,
    priority: 3,
};

/// Settings for [`LOOSE_TESTS_BATCH`].
pub const LOOSE_TESTS_RULE: BatchRule = BatchRule {
    pattern: "",
    timeout_secs: 90,
    workers: Some(WorkerCount::Auto),
    blocking: true,
    priority: 2,
};

fn compiled_rules() -> &'static [(BatchRule, Regex)] {
    static RULES: OnceLock<Vec<(BatchRule, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        BATCH_RULES
            .iter()
            .filter_map(|rule| {
                Regex::new(&format!("^(?:{})$", rule.pattern))
                    .ok()
                    .map(|re| (*rule, re))
            })
            .collect()
    })
}

/// Rule for a test directory name.
pub fn rule_for(dir_name: &str) -> BatchRule {
    let name = dir_name.to_lowercase();
    compiled_rules()
        .iter()
        .find(|(_, re)| re.is_match(&name))
        .map(|(rule, _)| *rule)
        .unwrap_or(DEFAULT_RULE)
}

/// A group of tests run in one runner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBatch {
    pub name: String,
    /// Directory, or individual files for the loose batch
    pub paths: Vec<PathBuf>,
    pub timeout_secs: u64,
    pub workers: Option<WorkerCount>,
    pub blocking: bool,
    pub priority: u8,
}

impl TestBatch {
    pub fn from_rule(name: impl Into<String>, paths: Vec<PathBuf>, rule: BatchRule) -> Self {
        Self {
            name: name.into(),
            paths,
            timeout_secs: rule.timeout_secs,
            workers: rule.workers,
            blocking: rule.blocking,
            priority: rule.priority,
        }
    }

    /// Batch for a test subdirectory, configured from its name.
    pub fn for_directory(name: impl Into<String>, dir: PathBuf) -> Self {
        let name = name.into();
        let rule = rule_for(&name);
        Self::from_rule(name, vec![dir], rule)
    }

    /// The synthetic batch for files directly under the test root.
    pub fn loose(files: Vec<PathBuf>) -> Self {
        Self::from_rule(LOOSE_TESTS_BATCH, files, LOOSE_TESTS_RULE)
    }

    pub fn is_parallel(&self) -> bool {
        self.workers.is_some()
    }

    /// Primary batches collect coverage.
    pub fn is_primary(&self) -> bool {
        self.priority == 2
    }
}

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Passed,
    Failed,
    TimedOut,
    /// Runner binary not found; the batch is unassessed, not failed
    ToolMissing,
    /// Runner crashed or produced no usable result
    ToolError,
    /// Not run because a blocking batch failed first
    Skipped,
}

impl BatchStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::TimedOut | BatchStatus::ToolError
        )
    }
}

/// Per-batch detail in a scheduler result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub name: String,
    pub status: BatchStatus,
    pub priority: u8,
    pub blocking: bool,
    pub paths: Vec<PathBuf>,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
    pub elapsed: Duration,
    pub failures: Vec<TestFailure>,
    pub reason: Option<String>,
}

impl BatchResult {
    /// Result for a batch that ran.
    pub fn from_summary(batch: &TestBatch, summary: TestRunSummary) -> Self {
        let status = match summary.status {
            TestRunStatus::Passed | TestRunStatus::NoTests => BatchStatus::Passed,
            TestRunStatus::Failed => BatchStatus::Failed,
            TestRunStatus::TimedOut => BatchStatus::TimedOut,
            TestRunStatus::ToolMissing => BatchStatus::ToolMissing,
            TestRunStatus::ToolError => BatchStatus::ToolError,
        };
        let reason = match status {
            BatchStatus::Passed | BatchStatus::Skipped => None,
            BatchStatus::Failed => Some(format!(
                "{} failed, {} errors",
                summary.failed, summary.errors
            )),
            BatchStatus::TimedOut => Some(format!(
                "timed out after {}s",
                batch.timeout_secs
            )),
            BatchStatus::ToolMissing => Some(
                summary
                    .message
                    .clone()
                    .unwrap_or_else(|| "test runner not found".to_string()),
            ),
            BatchStatus::ToolError => Some(
                summary
                    .message
                    .clone()
                    .unwrap_or_else(|| "test runner error".to_string()),
            ),
        };

        Self {
            name: batch.name.clone(),
            status,
            priority: batch.priority,
            blocking: batch.blocking,
            paths: batch.paths.clone(),
            passed: summary.passed,
            failed: summary.failed,
            errors: summary.errors,
            skipped: summary.skipped,
            elapsed: summary.elapsed,
            failures: summary.failures,
            reason,
        }
    }

    /// Result for a batch that never ran.
    pub fn skipped(batch: &TestBatch, halted_by: &str) -> Self {
        Self {
            name: batch.name.clone(),
            status: BatchStatus::Skipped,
            priority: batch.priority,
            blocking: batch.blocking,
            paths: batch.paths.clone(),
            passed: 0,
            failed: 0,
            errors: 0,
            skipped: 0,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
            reason: Some(format!("blocking batch '{halted_by}' failed")),
        }
    }
}
