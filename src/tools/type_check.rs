//! Static type checker integration.
//!
//! Invoked as `<checker> --outputjson [--project <config>] <source-dir>`.
//! The JSON report carries a `generalDiagnostics` array and a `summary`
//! object; line and character positions in the report are 0-based.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::diagnostic::{absolute_path_string, Diagnostic, DiagnosticLevel, DiagnosticSource};
use super::{find_config_file, stderr_tail, AnalysisReport, ToolStatus};
use crate::process::{CommandRunner, CommandSpec, ToolError};

/// Configuration files searched for, in order.
pub const CONFIG_FILES: &[&str] = &["pyrightconfig.json", "pyproject.toml"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    #[serde(default)]
    general_diagnostics: Vec<RawDiagnostic>,
    #[serde(default)]
    summary: Option<Summary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    #[serde(default)]
    files_analyzed: usize,
}

#[derive(Debug, Deserialize)]
struct RawDiagnostic {
    #[serde(default)]
    file: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    rule: Option<String>,
    #[serde(default)]
    range: Option<Range>,
}

#[derive(Debug, Deserialize)]
struct Range {
    start: Position,
}

#[derive(Debug, Deserialize)]
struct Position {
    line: u32,
    character: u32,
}

/// Parse the checker's JSON report. `base_dir` resolves relative paths.
pub fn parse_report(stdout: &str, base_dir: &Path) -> Result<(Vec<Diagnostic>, usize), serde_json::Error> {
    let report: Report = serde_json::from_str(stdout)?;

    let diagnostics: Vec<Diagnostic> = report
        .general_diagnostics
        .into_iter()
        .map(|raw| {
            let (line, column) = raw
                .range
                .map(|r| (r.start.line + 1, r.start.character + 1))
                .unwrap_or((1, 1));
            let mut diagnostic = Diagnostic::new(
                absolute_path_string(&raw.file, base_dir),
                line,
                raw.message,
            )
            .with_column(column)
            .with_level(DiagnosticLevel::from_tool(&raw.severity))
            .with_source(DiagnosticSource::TypeCheck);
            diagnostic.rule = raw.rule;
            diagnostic
        })
        .collect();

    let file_count = match report.summary {
        Some(summary) if summary.files_analyzed > 0 => summary.files_analyzed,
        _ => {
            let mut files: Vec<&str> = diagnostics.iter().map(|d| d.file.as_str()).collect();
            files.sort_unstable();
            files.dedup();
            files.len()
        }
    };
    Ok((diagnostics, file_count))
}

/// Runs the type checker over a source directory.
#[derive(Clone)]
pub struct TypeCheckIntegrator {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
}

impl TypeCheckIntegrator {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
        }
    }

    /// Configuration file in `source_dir` or its parent.
    pub fn find_config(source_dir: &Path) -> Option<PathBuf> {
        find_config_file(source_dir, CONFIG_FILES)
    }

    pub fn build_command(&self, source_dir: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program, self.timeout).arg("--outputjson");
        if let Some(config) = Self::find_config(source_dir) {
            spec = spec.arg("--project").arg(config.display().to_string());
        }
        spec.arg(source_dir.display().to_string())
    }

    /// Type-check `source_dir`. Never fails; tool problems are reported in
    /// the returned status.
    pub async fn check(&self, source_dir: &Path) -> AnalysisReport {
        let spec = self.build_command(source_dir);
        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(err) => return self.tool_failure(err),
        };

        // The checker runs in our working directory; relative paths are relative to it.
        let base_dir = std::env::current_dir().unwrap_or_default();
        let stdout = output.stdout.clone();

        // Reports for large trees run to megabytes; parse off the event loop.
        let parsed =
            tokio::task::spawn_blocking(move || parse_report(&stdout, &base_dir)).await;

        match parsed {
            Ok(Ok((diagnostics, file_count))) => {
                let report = AnalysisReport::completed(&self.program, diagnostics, file_count);
                debug!(
                    tool = %self.program,
                    errors = report.error_count,
                    warnings = report.warning_count,
                    files = report.file_count,
                    "type check complete"
                );
                report
            }
            Ok(Err(err)) => {
                warn!(tool = %self.program, error = %err, "type checker output was not valid JSON");
                AnalysisReport::unavailable(
                    &self.program,
                    ToolStatus::Failed,
                    format!(
                        "unparseable output (exit {:?}): {err}. {}",
                        output.exit_code,
                        stderr_tail(&output.stderr)
                    ),
                )
            }
            Err(join_err) => AnalysisReport::unavailable(
                &self.program,
                ToolStatus::Failed,
                format!("report parsing failed: {join_err}"),
            ),
        }
    }

    fn tool_failure(&self, err: ToolError) -> AnalysisReport {
        let status = match &err {
            ToolError::NotFound { .. } => ToolStatus::Missing,
            ToolError::Timeout { .. } => ToolStatus::TimedOut,
            ToolError::Io { .. } => ToolStatus::Failed,
        };
        warn!(tool = %self.program, error = %err, "type checker unavailable");
        AnalysisReport::unavailable(&self.program, status, err.to_string())
    }
}
