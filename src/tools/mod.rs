//! Integrators for the external analyzers and the test runner.
//!
//! Each integrator assembles the tool's command line, runs it through a
//! [`CommandRunner`](crate::process::CommandRunner) and turns the output into
//! [`Diagnostic`]s or a [`TestRunSummary`]. Tool failures never escape as
//! errors: a missing binary, a timeout or unparseable output is reported in
//! the returned report's [`ToolStatus`].

pub mod diagnostic;
pub mod lint;
pub mod test_run;
pub mod type_check;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use diagnostic::{
    absolute_path, errors_by_file, Diagnostic, DiagnosticLevel, DiagnosticSource,
};
pub use lint::LintIntegrator;
pub use test_run::{
    TestFailure, TestRunIntegrator, TestRunOptions, TestRunStatus, TestRunSummary, WorkerCount,
};
pub use type_check::TypeCheckIntegrator;

/// How a tool invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// The tool ran and its output was parsed
    Completed,
    /// The binary is not installed
    Missing,
    /// The tool exceeded its timeout
    TimedOut,
    /// The tool crashed or produced unparseable output
    Failed,
}

/// Normalized result of one analyzer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub tool: String,
    pub status: ToolStatus,
    /// Completed with no residual errors
    pub success: bool,
    pub diagnostics: Vec<Diagnostic>,
    /// Error-level diagnostics per absolute file path
    pub errors_by_file: BTreeMap<String, Vec<Diagnostic>>,
    pub file_count: usize,
    pub error_count: usize,
    pub warning_count: usize,
    /// Findings the tool fixed in place (lint with auto-fix only)
    pub fixed_count: usize,
    pub message: Option<String>,
}

impl AnalysisReport {
    /// Report for a completed run.
    pub fn completed(tool: impl Into<String>, diagnostics: Vec<Diagnostic>, file_count: usize) -> Self {
        let errors_by_file = errors_by_file(&diagnostics);
        let error_count = diagnostics.iter().filter(|d| d.is_error()).count();
        let warning_count = diagnostics
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Warning)
            .count();
        Self {
            tool: tool.into(),
            status: ToolStatus::Completed,
            success: error_count == 0,
            diagnostics,
            errors_by_file,
            file_count,
            error_count,
            warning_count,
            fixed_count: 0,
            message: None,
        }
    }

    /// Report for a run that produced no usable output.
    pub fn unavailable(
        tool: impl Into<String>,
        status: ToolStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            status,
            success: false,
            diagnostics: Vec::new(),
            errors_by_file: BTreeMap::new(),
            file_count: 0,
            error_count: 0,
            warning_count: 0,
            fixed_count: 0,
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The tool did not run to completion for a reason other than absence.
    pub fn is_tool_error(&self) -> bool {
        matches!(self.status, ToolStatus::TimedOut | ToolStatus::Failed)
    }

    pub fn is_missing(&self) -> bool {
        self.status == ToolStatus::Missing
    }
}

/// First of `names` that exists in `dir` or, failing that, its parent.
pub(crate) fn find_config_file(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    let parent = dir.parent().filter(|p| !p.as_os_str().is_empty());
    std::iter::once(dir)
        .chain(parent)
        .flat_map(|candidate_dir| names.iter().map(move |name| candidate_dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Last few lines of a tool's stderr, for report messages.
pub(crate) fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_completed_report_counts_levels() {
        let report = AnalysisReport::completed(
            "pyright",
            vec![
                Diagnostic::new("/a.py", 1, "bad"),
                Diagnostic::new("/a.py", 2, "meh").with_level(DiagnosticLevel::Warning),
            ],
            4,
        );
        assert!(!report.success);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.warning_count, 1);
        assert_eq!(report.file_count, 4);
    }

    #[test]
    fn test_unavailable_report_is_not_success() {
        let report = AnalysisReport::unavailable("ruff", ToolStatus::Missing, "not installed");
        assert!(!report.success);
        assert!(report.is_missing());
        assert!(!report.is_tool_error());
    }

    #[test]
    fn test_find_config_prefers_source_dir_then_parent() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(temp_dir.path().join("pyproject.toml"), "").unwrap();

        assert_eq!(
            find_config_file(&src, &["pyrightconfig.json", "pyproject.toml"]),
            Some(temp_dir.path().join("pyproject.toml"))
        );

        fs::write(src.join("pyrightconfig.json"), "{}").unwrap();
        assert_eq!(
            find_config_file(&src, &["pyrightconfig.json", "pyproject.toml"]),
            Some(src.join("pyrightconfig.json"))
        );
    }
}
