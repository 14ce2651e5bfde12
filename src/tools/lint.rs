//! Lint-and-fix tool integration.
//!
//! Invoked as `<linter> check --output-format=json [--fix] [--config <config>]
//! <source-dir>`. Both a bare list and a `{"results": [...]}` object are
//! accepted. With auto-fix the tool runs twice: a check-only pass counts the
//! findings and the `--fix` pass reports what is left, so
//! `fixed_count = before - after`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::diagnostic::{absolute_path_string, Diagnostic, DiagnosticLevel, DiagnosticSource};
use super::{find_config_file, stderr_tail, AnalysisReport, ToolStatus};
use crate::process::{CommandRunner, CommandSpec, ToolError};

/// Dedicated configuration files, searched before `pyproject.toml`.
pub const CONFIG_FILES: &[&str] = &["ruff.toml", ".ruff.toml"];

/// Exit code for abnormal termination (bad config, internal error).
const EXIT_ABNORMAL: i32 = 2;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LintOutput {
    List(Vec<RawFinding>),
    Wrapped { results: Vec<RawFinding> },
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    location: Option<Location>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    fix: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Location {
    row: u32,
    column: u32,
}

/// Parse the linter's JSON output.
pub fn parse_findings(stdout: &str, base_dir: &Path) -> Result<Vec<Diagnostic>, serde_json::Error> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let findings = match serde_json::from_str::<LintOutput>(stdout)? {
        LintOutput::List(findings) => findings,
        LintOutput::Wrapped { results } => results,
    };

    Ok(findings
        .into_iter()
        .map(|raw| {
            let (line, column) = raw
                .location
                .map(|loc| (loc.row.max(1), loc.column.max(1)))
                .unwrap_or((1, 1));
            let mut diagnostic =
                Diagnostic::new(absolute_path_string(&raw.filename, base_dir), line, raw.message)
                    .with_column(column)
                    .with_level(DiagnosticLevel::Error)
                    .with_source(DiagnosticSource::Lint)
                    .with_fix_available(raw.fix.map_or(false, |fix| !fix.is_null()));
            diagnostic.rule = raw.code;
            diagnostic
        })
        .collect())
}

/// Runs the linter over a source directory, optionally fixing in place.
#[derive(Clone)]
pub struct LintIntegrator {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
}

impl LintIntegrator {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
        }
    }

    /// `ruff.toml`/`.ruff.toml` in `source_dir` or its parent, else a
    /// `pyproject.toml` that has a `[tool.ruff]` table.
    pub fn find_config(source_dir: &Path) -> Option<PathBuf> {
        find_config_file(source_dir, CONFIG_FILES).or_else(|| {
            find_config_file(source_dir, &["pyproject.toml"]).filter(|path| {
                fs::read_to_string(path)
                    .map(|content| content.contains("[tool.ruff"))
                    .unwrap_or(false)
            })
        })
    }

    pub fn build_command(&self, source_dir: &Path, fix: bool) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program, self.timeout)
            .arg("check")
            .arg("--output-format=json");
        if fix {
            spec = spec.arg("--fix");
        }
        if let Some(config) = Self::find_config(source_dir) {
            spec = spec.arg("--config").arg(config.display().to_string());
        }
        spec.arg(source_dir.display().to_string())
    }

    /// Lint `source_dir`. With `auto_fix` the tool rewrites files in place
    /// and the report's `fixed_count` says how many findings disappeared.
    pub async fn check(&self, source_dir: &Path, auto_fix: bool) -> AnalysisReport {
        let before = match self.run_pass(source_dir, false).await {
            Ok(findings) => findings,
            Err(report) => return report,
        };
        if !auto_fix || before.is_empty() {
            return self.report(before, 0);
        }

        let after = match self.run_pass(source_dir, true).await {
            Ok(findings) => findings,
            Err(report) => return report,
        };
        let fixed = before.len().saturating_sub(after.len());
        if fixed > 0 {
            info!(tool = %self.program, fixed, remaining = after.len(), "lint auto-fix applied");
        }
        self.report(after, fixed)
    }

    fn report(&self, findings: Vec<Diagnostic>, fixed_count: usize) -> AnalysisReport {
        let mut files: Vec<&str> = findings.iter().map(|d| d.file.as_str()).collect();
        files.sort_unstable();
        files.dedup();
        let file_count = files.len();

        let mut report = AnalysisReport::completed(&self.program, findings, file_count);
        report.fixed_count = fixed_count;
        debug!(
            tool = %self.program,
            remaining = report.error_count,
            fixed = fixed_count,
            "lint complete"
        );
        report
    }

    async fn run_pass(&self, source_dir: &Path, fix: bool) -> Result<Vec<Diagnostic>, AnalysisReport> {
        let spec = self.build_command(source_dir, fix);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|err| self.tool_failure(err))?;

        if output.exit_code == Some(EXIT_ABNORMAL) {
            return Err(AnalysisReport::unavailable(
                &self.program,
                ToolStatus::Failed,
                format!("linter terminated abnormally: {}", stderr_tail(&output.stderr)),
            ));
        }

        let base_dir = std::env::current_dir().unwrap_or_default();
        parse_findings(&output.stdout, &base_dir).map_err(|err| {
            warn!(tool = %self.program, error = %err, "linter output was not valid JSON");
            AnalysisReport::unavailable(
                &self.program,
                ToolStatus::Failed,
                format!("unparseable output: {err}"),
            )
        })
    }

    fn tool_failure(&self, err: ToolError) -> AnalysisReport {
        let status = match &err {
            ToolError::NotFound { .. } => ToolStatus::Missing,
            ToolError::Timeout { .. } => ToolStatus::TimedOut,
            ToolError::Io { .. } => ToolStatus::Failed,
        };
        warn!(tool = %self.program, error = %err, "linter unavailable");
        AnalysisReport::unavailable(&self.program, status, err.to_string())
    }
}
