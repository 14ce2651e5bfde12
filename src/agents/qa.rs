//! QA adjudication.
//!
//! Gate rule, evaluated over the QUALITY and TEST_AUTO results of the
//! current iteration (a skipped phase counts as succeeded):
//!
//! - a tool error in either phase → FAIL
//! - type check and tests succeeded, fewer than 10 warnings, no missing
//!   tool → PASS
//! - type check succeeded with at most 2 failing tests, or tests succeeded
//!   with at most 3 type errors → CONCERNS
//! - otherwise → FAIL
//!
//! WAIVED is never computed; an operator waiver turns FAIL into WAIVED.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;

use super::{CheckState, Outcome, PhaseAgent, PhaseReport, QualitySummary, StoryTask, TestAutomationSummary};
use crate::story::Phase;
use crate::verdict::{IssueSeverity, NfrAssessment, NfrStatus, QaGate, QaIssue, QaVerdict};

/// Reviewer id recorded on verdicts.
pub const REVIEWER: &str = "epic-driver-qa";

/// Warnings at or above this count prevent PASS.
pub const WARNING_LIMIT: usize = 10;
/// Failing tests tolerated for CONCERNS when the type check succeeded.
pub const CONCERN_FAILING_TESTS: u32 = 2;
/// Type errors tolerated for CONCERNS when the tests succeeded.
pub const CONCERN_TYPE_ERRORS: usize = 3;

const MAX_ISSUES: usize = 5;

/// The figures the gate is computed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QaInputs {
    pub type_check_succeeded: bool,
    pub tests_succeeded: bool,
    pub type_errors: usize,
    pub lint_errors: usize,
    pub warnings: usize,
    pub failing_tests: u32,
    pub tool_error: bool,
    pub tool_missing: bool,
    pub quality_assessed: bool,
    pub tests_assessed: bool,
}

impl QaInputs {
    pub fn collect(quality: Option<&QualitySummary>, tests: Option<&TestAutomationSummary>) -> Self {
        let mut inputs = Self {
            type_check_succeeded: true,
            tests_succeeded: true,
            ..Self::default()
        };
        if let Some(quality) = quality {
            inputs.quality_assessed = true;
            inputs.type_check_succeeded = quality.type_check.state() == CheckState::Clean;
            inputs.type_errors = quality.type_check.error_count;
            inputs.lint_errors = quality.lint.error_count;
            inputs.warnings = quality.total_warnings();
            inputs.tool_error |= quality.has_tool_error();
            inputs.tool_missing |= quality.has_missing_tool();
        }
        if let Some(tests) = tests {
            inputs.tests_assessed = true;
            inputs.tests_succeeded = tests.succeeded();
            inputs.failing_tests = tests.failing_tests;
            inputs.tool_error |= tests.tool_error || tests.timed_out;
            inputs.tool_missing |= tests.tool_missing;
        }
        inputs
    }

    pub fn gate(&self) -> QaGate {
        if self.tool_error {
            QaGate::Fail
        } else if self.type_check_succeeded
            && self.tests_succeeded
            && self.warnings < WARNING_LIMIT
            && !self.tool_missing
        {
            QaGate::Pass
        } else if (self.type_check_succeeded && self.failing_tests <= CONCERN_FAILING_TESTS)
            || (self.tests_succeeded && self.type_errors <= CONCERN_TYPE_ERRORS)
        {
            QaGate::Concerns
        } else {
            QaGate::Fail
        }
    }

    /// 100 minus weighted deductions, floored at 0.
    pub fn score(&self) -> u8 {
        let deductions = (self.type_errors * 5).min(40)
            + (self.failing_tests as usize * 10).min(40)
            + self.warnings.min(10)
            + if self.tool_error { 30 } else { 0 }
            + if self.tool_missing { 5 } else { 0 };
        100usize.saturating_sub(deductions) as u8
    }
}

fn reason_for(gate: QaGate, inputs: &QaInputs) -> String {
    match gate {
        QaGate::Pass => "all checks passed".to_string(),
        QaGate::Concerns if inputs.tool_missing && inputs.type_errors == 0 && inputs.failing_tests == 0 => {
            "checks passed but an analysis tool was unavailable".to_string()
        }
        QaGate::Concerns => format!(
            "bounded issues: {} type errors, {} failing tests, {} warnings",
            inputs.type_errors, inputs.failing_tests, inputs.warnings
        ),
        QaGate::Fail if inputs.tool_error => "a quality or test tool failed".to_string(),
        QaGate::Fail => format!(
            "{} type errors and {} failing tests exceed the gate",
            inputs.type_errors, inputs.failing_tests
        ),
        QaGate::Waived => "waived".to_string(),
    }
}

fn collect_issues(quality: Option<&QualitySummary>, tests: Option<&TestAutomationSummary>) -> Vec<QaIssue> {
    let mut issues = Vec::new();
    if let Some(quality) = quality {
        for tool in [&quality.type_check, &quality.lint] {
            match tool.state() {
                CheckState::ToolError => issues.push(QaIssue::new(
                    IssueSeverity::High,
                    &tool.tool,
                    tool.message.clone().unwrap_or_else(|| "tool error".to_string()),
                )),
                CheckState::ToolMissing => issues.push(QaIssue::new(
                    IssueSeverity::Medium,
                    &tool.tool,
                    "tool not available; results not assessed",
                )),
                CheckState::Clean | CheckState::Issues => {}
            }
        }
        if quality.critical_count > 0 {
            issues.push(QaIssue::new(
                IssueSeverity::High,
                "type_check",
                format!("{} critical diagnostics", quality.critical_count),
            ));
        }
        for group in &quality.top_groups {
            issues.push(QaIssue::new(
                if group.auto_fixable { IssueSeverity::Low } else { IssueSeverity::Medium },
                if group.rule.is_empty() { "diagnostics" } else { group.rule.as_str() },
                format!("{} x {}", group.size(), group.pattern),
            ));
        }
    }
    if let Some(tests) = tests {
        if tests.tool_missing {
            issues.push(QaIssue::new(
                IssueSeverity::Medium,
                "tests",
                "test runner not available; batches not assessed",
            ));
        }
        for batch in tests.result.batches.iter().filter(|b| b.status.is_failure()) {
            issues.push(QaIssue::new(
                if batch.blocking { IssueSeverity::High } else { IssueSeverity::Medium },
                "tests",
                format!(
                    "batch '{}': {}",
                    batch.name,
                    batch.reason.as_deref().unwrap_or("failed")
                ),
            ));
        }
    }
    issues.truncate(MAX_ISSUES);
    issues
}

fn nfr_validation(
    inputs: &QaInputs,
    quality: Option<&QualitySummary>,
    tests: Option<&TestAutomationSummary>,
) -> BTreeMap<String, NfrAssessment> {
    let mut nfr = BTreeMap::new();
    let maintainability = match quality {
        None => NfrAssessment::new(NfrStatus::NotAssessed, "quality phase skipped"),
        Some(q) if q.has_tool_error() => NfrAssessment::new(NfrStatus::Fail, "analysis tool failed"),
        Some(q) if q.residual_errors == 0 => NfrAssessment::new(
            NfrStatus::Pass,
            format!("{} lint findings auto-fixed", q.auto_fixed),
        ),
        Some(q) => NfrAssessment::new(
            NfrStatus::Concerns,
            format!("{} residual errors", q.residual_errors),
        ),
    };
    nfr.insert("maintainability".to_string(), maintainability);

    let reliability = match tests {
        None => NfrAssessment::new(NfrStatus::NotAssessed, "test phase skipped"),
        Some(t) if t.succeeded() => NfrAssessment::new(
            NfrStatus::Pass,
            format!("{} tests passed in {} batches", t.passed_tests, t.total_batches),
        ),
        Some(t) if inputs.failing_tests <= CONCERN_FAILING_TESTS && !t.timed_out => NfrAssessment::new(
            NfrStatus::Concerns,
            format!("{} failing tests", t.failing_tests),
        ),
        Some(t) => NfrAssessment::new(
            NfrStatus::Fail,
            format!("failed batches: {}", t.failed_batches.join(", ")),
        ),
    };
    nfr.insert("reliability".to_string(), reliability);
    nfr
}

fn recommendations(inputs: &QaInputs, quality: Option<&QualitySummary>) -> Vec<String> {
    let mut recommendations = Vec::new();
    if inputs.tool_missing {
        recommendations.push("Install the missing analysis tools and re-run the quality gate".to_string());
    }
    if let Some(quality) = quality {
        for group in quality.top_groups.iter().filter(|g| g.common_fix.is_some()) {
            if let Some(fix) = &group.common_fix {
                recommendations.push(format!("{} ({} occurrences)", fix, group.size()));
            }
        }
    }
    if inputs.failing_tests > 0 {
        recommendations.push(format!("Fix the {} failing tests", inputs.failing_tests));
    }
    if inputs.warnings >= WARNING_LIMIT {
        recommendations.push(format!("Reduce warnings below {WARNING_LIMIT}"));
    }
    recommendations
}

/// Adjudicates the story from the earlier phases' results.
#[derive(Debug, Clone, Default)]
pub struct QaAgent {
    waiver: Option<String>,
}

impl QaAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator waiver: a FAIL gate becomes WAIVED with `reason`.
    pub fn with_waiver(mut self, reason: impl Into<String>) -> Self {
        self.waiver = Some(reason.into());
        self
    }

    pub fn review(&self, quality: Option<&QualitySummary>, tests: Option<&TestAutomationSummary>) -> QaVerdict {
        let inputs = QaInputs::collect(quality, tests);
        let computed = inputs.gate();
        let (gate, status_reason) = match (&self.waiver, computed) {
            (Some(reason), QaGate::Fail) => (QaGate::Waived, reason.clone()),
            (_, gate) => (gate, reason_for(gate, &inputs)),
        };

        QaVerdict {
            gate,
            status_reason,
            quality_score: inputs.score(),
            reviewer: REVIEWER.to_string(),
            top_issues: collect_issues(quality, tests),
            nfr_validation: nfr_validation(&inputs, quality, tests),
            recommendations: recommendations(&inputs, quality),
        }
    }
}

#[async_trait]
impl PhaseAgent for QaAgent {
    fn phase(&self) -> Phase {
        Phase::Qa
    }

    async fn execute(&self, task: &StoryTask) -> Outcome {
        let verdict = self.review(task.artifacts.quality.as_ref(), task.artifacts.tests.as_ref());
        info!(
            story = %task.story_id,
            gate = %verdict.gate,
            score = verdict.quality_score,
            "QA verdict"
        );
        if verdict.gate.is_passing() {
            Outcome::success(PhaseReport::Qa(verdict))
        } else {
            let reason = format!("QA gate FAIL: {}", verdict.status_reason);
            Outcome::failure(PhaseReport::Qa(verdict), reason)
        }
    }
}
