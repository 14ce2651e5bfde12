//! Quality gate: type check, lint with auto-fix, classification.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{CheckState, Outcome, PhaseAgent, PhaseReport, StoryTask};
use crate::classify::{ClassificationResult, ClassificationStats, ErrorClassifier, ErrorGroup, Severity};
use crate::store::{FixStatus, QualityRecord};
use crate::story::Phase;
use crate::tools::{AnalysisReport, Diagnostic, LintIntegrator, ToolStatus, TypeCheckIntegrator};

/// Number of groups listed in [`QualitySummary::top_groups`].
pub const TOP_GROUPS: usize = 5;

/// One tool's result, as carried to the QA phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSummary {
    pub tool: String,
    pub status: ToolStatus,
    pub success: bool,
    pub error_count: usize,
    pub warning_count: usize,
    pub file_count: usize,
    pub message: Option<String>,
}

impl ToolSummary {
    pub fn from_report(report: &AnalysisReport) -> Self {
        Self {
            tool: report.tool.clone(),
            status: report.status,
            success: report.success,
            error_count: report.error_count,
            warning_count: report.warning_count,
            file_count: report.file_count,
            message: report.message.clone(),
        }
    }

    pub fn state(&self) -> CheckState {
        match self.status {
            ToolStatus::Missing => CheckState::ToolMissing,
            ToolStatus::TimedOut | ToolStatus::Failed => CheckState::ToolError,
            ToolStatus::Completed if self.success => CheckState::Clean,
            ToolStatus::Completed => CheckState::Issues,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualitySummary {
    pub type_check: ToolSummary,
    pub lint: ToolSummary,
    /// Lint findings removed by auto-fix
    pub auto_fixed: usize,
    /// Errors left after auto-fix, both tools
    pub residual_errors: usize,
    pub critical_count: usize,
    pub top_groups: Vec<ErrorGroup>,
    pub stats: ClassificationStats,
}

impl QualitySummary {
    /// Warnings counted by the QA gate. Every lint finding is an error-level
    /// diagnostic, so residual lint findings count here too.
    pub fn total_warnings(&self) -> usize {
        self.type_check.warning_count + self.lint.error_count
    }

    pub fn has_tool_error(&self) -> bool {
        self.type_check.state() == CheckState::ToolError || self.lint.state() == CheckState::ToolError
    }

    pub fn has_missing_tool(&self) -> bool {
        self.type_check.state() == CheckState::ToolMissing || self.lint.state() == CheckState::ToolMissing
    }
}

/// Per-file quality records for residual diagnostics.
fn build_records(
    task: &StoryTask,
    type_check: &AnalysisReport,
    lint: &AnalysisReport,
    classification: &ClassificationResult,
) -> Vec<QualityRecord> {
    let mut per_file: BTreeMap<&str, (Vec<Diagnostic>, Vec<Diagnostic>)> = BTreeMap::new();
    for diagnostic in type_check.diagnostics.iter().filter(|d| d.is_error()) {
        per_file.entry(&diagnostic.file).or_default().0.push(diagnostic.clone());
    }
    for diagnostic in &lint.diagnostics {
        per_file.entry(&diagnostic.file).or_default().1.push(diagnostic.clone());
    }

    per_file
        .into_iter()
        .map(|(file, (type_errors, lint_errors))| {
            let error_count = (type_errors.len() + lint_errors.len()) as u32;
            let any_auto_fixable = classification
                .diagnostics
                .iter()
                .any(|c| c.diagnostic.file == file && c.auto_fixable);
            let fix_status = if any_auto_fixable {
                FixStatus::Pending
            } else {
                FixStatus::Deferred
            };
            QualityRecord::new(&task.epic_id, task.story_key(), file)
                .with_error_count(error_count)
                .with_fix_status(fix_status)
                .with_type_check_errors(type_errors)
                .with_lint_errors(lint_errors)
        })
        .collect()
}

/// Runs the type checker and the linter over the source tree and
/// classifies what is left after auto-fix.
///
/// The phase fails only on a tool error (timeout, crash, unparseable
/// output). Residual and critical diagnostics, like a missing tool, are left
/// for QA to weigh.
#[derive(Clone)]
pub struct QualityAgent {
    type_check: TypeCheckIntegrator,
    lint: LintIntegrator,
    classifier: ErrorClassifier,
    source_dir: PathBuf,
}

impl QualityAgent {
    pub fn new(
        type_check: TypeCheckIntegrator,
        lint: LintIntegrator,
        classifier: ErrorClassifier,
        source_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            type_check,
            lint,
            classifier,
            source_dir: source_dir.into(),
        }
    }
}

#[async_trait]
impl PhaseAgent for QualityAgent {
    fn phase(&self) -> Phase {
        Phase::Quality
    }

    async fn execute(&self, task: &StoryTask) -> Outcome {
        // Fix first so the type checker sees the rewritten files.
        let lint = self.lint.check(&self.source_dir, true).await;
        let type_check = self.type_check.check(&self.source_dir).await;

        let mut diagnostics = type_check.diagnostics.clone();
        diagnostics.extend(lint.diagnostics.iter().cloned());
        let classification = self.classifier.classify(&diagnostics);

        let critical_count = classification
            .with_severity(Severity::Critical)
            .filter(|c| c.diagnostic.is_error())
            .count();
        let summary = QualitySummary {
            type_check: ToolSummary::from_report(&type_check),
            lint: ToolSummary::from_report(&lint),
            auto_fixed: lint.fixed_count,
            residual_errors: type_check.error_count + lint.error_count,
            critical_count,
            top_groups: classification
                .top_groups(TOP_GROUPS)
                .into_iter()
                .cloned()
                .collect(),
            stats: classification.stats.clone(),
        };
        let records = build_records(task, &type_check, &lint, &classification);

        info!(
            story = %task.story_id,
            residual = summary.residual_errors,
            auto_fixed = summary.auto_fixed,
            critical = summary.critical_count,
            groups = summary.stats.group_count,
            "quality gate evaluated"
        );

        let failure = if summary.has_tool_error() {
            let message = [&summary.type_check, &summary.lint]
                .iter()
                .filter(|tool| tool.state() == CheckState::ToolError)
                .map(|tool| {
                    format!(
                        "{}: {}",
                        tool.tool,
                        tool.message.as_deref().unwrap_or("tool error")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            Some(format!("quality tool error: {message}"))
        } else {
            None
        };

        if summary.has_missing_tool() {
            warn!(story = %task.story_id, "quality tool missing; continuing without it");
        }

        let report = PhaseReport::Quality(summary);
        let outcome = match failure {
            Some(reason) => Outcome::failure(report, reason),
            None => Outcome::success(report),
        };
        outcome.with_quality_records(records)
    }
}
