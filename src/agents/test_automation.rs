//! Test automation: runs the discovered test batches.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Outcome, PhaseAgent, PhaseReport, StoryTask};
use crate::scheduler::{BatchStatus, SchedulerResult, SchedulerStatus, TestBatchScheduler};
use crate::store::{FixStatus, TestPhaseRecord};
use crate::story::Phase;

/// Longest debug note kept on a test record.
const MAX_NOTES_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct TestAutomationSummary {
    pub status: SchedulerStatus,
    pub total_batches: usize,
    pub passed_batches: usize,
    pub failed_batches: Vec<String>,
    pub skipped_batches: Vec<String>,
    pub halted_by: Option<String>,
    pub passed_tests: u32,
    pub failing_tests: u32,
    pub timed_out: bool,
    /// A batch could not run because the runner crashed
    pub tool_error: bool,
    /// The runner binary was not found; batches went unassessed
    pub tool_missing: bool,
    pub result: SchedulerResult,
}

impl TestAutomationSummary {
    pub fn from_result(result: SchedulerResult) -> Self {
        Self {
            status: result.status,
            total_batches: result.total_batches(),
            passed_batches: result.passed_batches(),
            failed_batches: result.failed_batches.clone(),
            skipped_batches: result.skipped_batches.clone(),
            halted_by: result.halted_by.clone(),
            passed_tests: result.passed_tests(),
            failing_tests: result.failing_tests(),
            timed_out: result.any_timed_out(),
            tool_error: result
                .batches
                .iter()
                .any(|b| b.status == BatchStatus::ToolError),
            tool_missing: result.any_tool_missing(),
            result,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == SchedulerStatus::Completed
    }
}

fn truncate_notes(mut notes: String) -> String {
    if notes.len() > MAX_NOTES_LEN {
        let mut cut = MAX_NOTES_LEN;
        while !notes.is_char_boundary(cut) {
            cut -= 1;
        }
        notes.truncate(cut);
        notes.push_str("...");
    }
    notes
}

/// One record per failing test file; a timed-out batch gets one record per
/// batch path since no per-file detail is available.
fn build_records(task: &StoryTask, result: &SchedulerResult) -> Vec<TestPhaseRecord> {
    let mut records = Vec::new();
    for batch in &result.batches {
        match batch.status {
            BatchStatus::TimedOut => {
                for path in &batch.paths {
                    records.push(
                        TestPhaseRecord::new(&task.epic_id, task.story_key(), path.display().to_string())
                            .with_failure_count(1)
                            .with_fix_status(FixStatus::Pending)
                            .with_debug_notes(format!(
                                "batch '{}' {}",
                                batch.name,
                                batch.reason.as_deref().unwrap_or("timed out")
                            )),
                    );
                }
            }
            BatchStatus::Failed => {
                let mut by_file: BTreeMap<&str, Vec<String>> = BTreeMap::new();
                for failure in &batch.failures {
                    let label = match &failure.test {
                        Some(test) if failure.reason.is_empty() => test.clone(),
                        Some(test) => format!("{test}: {}", failure.reason),
                        None => failure.reason.clone(),
                    };
                    by_file.entry(failure.file.as_str()).or_default().push(label);
                }
                for (file, failures) in by_file {
                    records.push(
                        TestPhaseRecord::new(&task.epic_id, task.story_key(), file)
                            .with_failure_count(failures.len() as u32)
                            .with_fix_status(FixStatus::Pending)
                            .with_debug_notes(truncate_notes(failures.join("\n"))),
                    );
                }
            }
            _ => {}
        }
    }
    records
}

/// Runs the test batch scheduler against the test tree.
///
/// The phase fails when a blocking batch halts the run or any batch times
/// out. A failing non-blocking batch or a missing runner is left for QA to
/// weigh.
#[derive(Clone)]
pub struct TestAutomationAgent {
    scheduler: TestBatchScheduler,
}

impl TestAutomationAgent {
    pub fn new(scheduler: TestBatchScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl PhaseAgent for TestAutomationAgent {
    fn phase(&self) -> Phase {
        Phase::TestAuto
    }

    async fn execute(&self, task: &StoryTask) -> Outcome {
        let result = match self.scheduler.run().await {
            Ok(result) => result,
            Err(err) => {
                warn!(story = %task.story_id, error = %err, "test discovery failed");
                return Outcome::failure(PhaseReport::Empty, err.to_string());
            }
        };

        let records = build_records(task, &result);
        let summary = TestAutomationSummary::from_result(result);
        info!(
            story = %task.story_id,
            batches = summary.total_batches,
            passed = summary.passed_batches,
            failed = summary.failed_batches.len(),
            "test automation finished"
        );
        if summary.tool_missing {
            warn!(story = %task.story_id, "test runner not available; tests left for QA to weigh");
        }

        let failure = if let Some(blocker) = &summary.halted_by {
            Some(format!("blocking test batch '{blocker}' failed"))
        } else if summary.timed_out {
            Some("a test batch timed out".to_string())
        } else {
            None
        };

        let report = PhaseReport::TestAutomation(summary);
        let outcome = match failure {
            Some(reason) => Outcome::failure(report, reason),
            None => Outcome::success(report),
        };
        outcome.with_test_records(records)
    }
}
