//! Test batch scheduler.
//!
//! Discovers test batches under a test root at run time and runs them one
//! after another in priority order. A failing blocking batch halts the run;
//! the remaining batches are reported as skipped. A failing non-blocking
//! batch is recorded and the run continues.

pub mod batch;
pub mod discovery;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::timeout::TimeoutConfig;
use crate::tools::{TestRunIntegrator, TestRunOptions};

pub use batch::{rule_for, BatchResult, BatchRule, BatchStatus, TestBatch, LOOSE_TESTS_BATCH};
pub use discovery::{discover_batches, is_test_file};

/// `--maxfail` ceiling for blocking batches.
pub const MAX_FAIL: u32 = 5;

/// Errors that prevent scheduling altogether.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The test root could not be read.
    #[error("failed to discover test batches in {path}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The discovery task panicked or was cancelled.
    #[error("test discovery task failed: {0}")]
    Task(String),
}

/// Overall outcome of a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerResult {
    pub status: SchedulerStatus,
    /// Every discovered batch in execution order, skipped ones included
    pub batches: Vec<BatchResult>,
    pub failed_batches: Vec<String>,
    pub skipped_batches: Vec<String>,
    /// Blocking batch whose failure stopped the run
    pub halted_by: Option<String>,
    pub elapsed: Duration,
}

impl SchedulerResult {
    pub fn is_completed(&self) -> bool {
        self.status == SchedulerStatus::Completed
    }

    /// Batches that ran.
    pub fn executed(&self) -> impl Iterator<Item = &BatchResult> {
        self.batches
            .iter()
            .filter(|b| b.status != BatchStatus::Skipped)
    }

    pub fn total_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn passed_batches(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.status == BatchStatus::Passed)
            .count()
    }

    pub fn any_timed_out(&self) -> bool {
        self.batches
            .iter()
            .any(|b| b.status == BatchStatus::TimedOut)
    }

    /// True when some batch went unassessed because the runner was missing.
    pub fn any_tool_missing(&self) -> bool {
        self.batches
            .iter()
            .any(|b| b.status == BatchStatus::ToolMissing)
    }

    /// Failed plus errored tests over all batches.
    pub fn failing_tests(&self) -> u32 {
        self.batches.iter().map(|b| b.failed + b.errors).sum()
    }

    pub fn passed_tests(&self) -> u32 {
        self.batches.iter().map(|b| b.passed).sum()
    }
}

/// Runs discovered test batches through a [`TestRunIntegrator`].
#[derive(Clone)]
pub struct TestBatchScheduler {
    integrator: TestRunIntegrator,
    test_root: PathBuf,
    coverage_source: Option<PathBuf>,
    batch_grace: Duration,
    verbose: bool,
}

impl TestBatchScheduler {
    pub fn new(integrator: TestRunIntegrator, test_root: impl Into<PathBuf>) -> Self {
        Self {
            integrator,
            test_root: test_root.into(),
            coverage_source: None,
            batch_grace: TimeoutConfig::default().batch_grace,
            verbose: true,
        }
    }

    /// Source directory measured by coverage in primary batches.
    pub fn with_coverage_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.coverage_source = Some(source.into());
        self
    }

    /// Extra time on top of each batch's own timeout.
    pub fn with_batch_grace(mut self, grace: Duration) -> Self {
        self.batch_grace = grace;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn test_root(&self) -> &Path {
        &self.test_root
    }

    /// Runner options for `batch`.
    pub fn options_for(&self, batch: &TestBatch) -> TestRunOptions {
        let timeout = Duration::from_secs(batch.timeout_secs) + self.batch_grace;
        let mut options = TestRunOptions::new(batch.paths.clone(), timeout).with_verbose(self.verbose);
        if let Some(workers) = batch.workers {
            options = options.with_workers(workers);
        }
        if batch.is_primary() {
            if let Some(source) = &self.coverage_source {
                options = options.with_coverage(source.clone());
            }
        }
        if batch.blocking {
            options = options.with_max_fail(MAX_FAIL);
        }
        options
    }

    /// Discover batches off the event loop.
    pub async fn discover(&self) -> Result<Vec<TestBatch>, SchedulerError> {
        let root = self.test_root.clone();
        tokio::task::spawn_blocking(move || {
            discover_batches(&root).map_err(|source| SchedulerError::Discovery { path: root, source })
        })
        .await
        .map_err(|err| SchedulerError::Task(err.to_string()))?
    }

    /// Discover and run every batch.
    pub async fn run(&self) -> Result<SchedulerResult, SchedulerError> {
        let batches = self.discover().await?;
        info!(
            root = %self.test_root.display(),
            batches = batches.len(),
            "test batches discovered"
        );
        Ok(self.run_batches(&batches).await)
    }

    /// Run `batches` sequentially in the given order.
    pub async fn run_batches(&self, batches: &[TestBatch]) -> SchedulerResult {
        let started = Instant::now();
        let mut results = Vec::with_capacity(batches.len());
        let mut failed_batches = Vec::new();
        let mut skipped_batches = Vec::new();
        let mut halted_by: Option<String> = None;

        for batch in batches {
            if let Some(blocker) = &halted_by {
                skipped_batches.push(batch.name.clone());
                results.push(BatchResult::skipped(batch, blocker));
                continue;
            }

            let options = self.options_for(batch);
            let summary = self.integrator.run(&options).await;
            let result = BatchResult::from_summary(batch, summary);

            if result.status.is_failure() {
                failed_batches.push(batch.name.clone());
                if batch.blocking {
                    warn!(
                        batch = %batch.name,
                        status = ?result.status,
                        reason = result.reason.as_deref().unwrap_or(""),
                        "blocking test batch failed; halting"
                    );
                    halted_by = Some(batch.name.clone());
                } else {
                    warn!(
                        batch = %batch.name,
                        status = ?result.status,
                        "non-blocking test batch failed; continuing"
                    );
                }
            } else if result.status == BatchStatus::ToolMissing {
                warn!(
                    batch = %batch.name,
                    reason = result.reason.as_deref().unwrap_or(""),
                    "test runner not available; batch not assessed"
                );
            } else {
                info!(
                    batch = %batch.name,
                    passed = result.passed,
                    skipped = result.skipped,
                    "test batch passed"
                );
            }
            results.push(result);
        }

        let status = if failed_batches.is_empty() {
            SchedulerStatus::Completed
        } else {
            SchedulerStatus::Failed
        };
        SchedulerResult {
            status,
            batches: results,
            failed_batches,
            skipped_batches,
            halted_by,
            elapsed: started.elapsed(),
        }
    }
}
