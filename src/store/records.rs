//! Phase record types persisted alongside story rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::story::{Phase, StoryStatus};
use crate::tools::Diagnostic;
use crate::verdict::{QaGate, QaVerdict};

/// Remediation state of a quality or test record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixStatus {
    /// Residual problems remain that may still be fixed automatically
    Pending,
    /// No residual problems remain
    Fixed,
    /// Residual problems need manual attention
    Deferred,
}

impl FixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixStatus::Pending => "PENDING",
            FixStatus::Fixed => "FIXED",
            FixStatus::Deferred => "DEFERRED",
        }
    }
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FixStatus::Pending),
            "FIXED" => Ok(FixStatus::Fixed),
            "DEFERRED" => Ok(FixStatus::Deferred),
            other => Err(format!("unknown fix status: {other}")),
        }
    }
}

/// Deterministic record id: hex `sha256(kind|epic|story|file)`.
///
/// The same (epic, story, file) triple always maps to the same id, so
/// re-recording a file during a retry overwrites the earlier row.
pub fn record_id(kind: &str, epic_id: &str, story_path: &str, file_path: &str) -> String {
    let mut hasher = Sha256::new();
    for (index, part) in [kind, epic_id, story_path, file_path].iter().enumerate() {
        if index > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// One row of `code_quality_phase`: the quality outcome for one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub id: String,
    pub epic_id: String,
    pub story_path: String,
    pub file_path: String,
    /// Residual errors after auto-fix
    pub error_count: u32,
    pub fix_status: FixStatus,
    pub type_check_errors: Vec<Diagnostic>,
    pub lint_errors: Vec<Diagnostic>,
    pub recorded_at: DateTime<Utc>,
}

impl QualityRecord {
    pub const KIND: &'static str = "quality";

    pub fn new(
        epic_id: impl Into<String>,
        story_path: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        let epic_id = epic_id.into();
        let story_path = story_path.into();
        let file_path = file_path.into();
        Self {
            id: record_id(Self::KIND, &epic_id, &story_path, &file_path),
            epic_id,
            story_path,
            file_path,
            error_count: 0,
            fix_status: FixStatus::Fixed,
            type_check_errors: Vec::new(),
            lint_errors: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_error_count(mut self, count: u32) -> Self {
        self.error_count = count;
        self
    }

    pub fn with_fix_status(mut self, status: FixStatus) -> Self {
        self.fix_status = status;
        self
    }

    pub fn with_type_check_errors(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.type_check_errors = diagnostics;
        self
    }

    pub fn with_lint_errors(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.lint_errors = diagnostics;
        self
    }
}

/// One row of `test_automation_phase`: failures attributed to one test file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPhaseRecord {
    pub id: String,
    pub epic_id: String,
    pub story_path: String,
    pub test_file_path: String,
    pub failure_count: u32,
    pub fix_status: FixStatus,
    pub debug_notes: String,
    pub recorded_at: DateTime<Utc>,
}

impl TestPhaseRecord {
    pub const KIND: &'static str = "test";

    pub fn new(
        epic_id: impl Into<String>,
        story_path: impl Into<String>,
        test_file_path: impl Into<String>,
    ) -> Self {
        let epic_id = epic_id.into();
        let story_path = story_path.into();
        let test_file_path = test_file_path.into();
        Self {
            id: record_id(Self::KIND, &epic_id, &story_path, &test_file_path),
            epic_id,
            story_path,
            test_file_path,
            failure_count: 0,
            fix_status: FixStatus::Pending,
            debug_notes: String::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_failure_count(mut self, count: u32) -> Self {
        self.failure_count = count;
        self
    }

    pub fn with_fix_status(mut self, status: FixStatus) -> Self {
        self.fix_status = status;
        self
    }

    pub fn with_debug_notes(mut self, notes: impl Into<String>) -> Self {
        self.debug_notes = notes.into();
        self
    }
}

/// One row of `phase_history`: a state entered by a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub story_path: String,
    pub iteration: u32,
    pub phase: Phase,
    pub status: StoryStatus,
    pub recorded_at: DateTime<Utc>,
}

/// One row of `qa_reviews`: the verdict of a single QA execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReview {
    pub story_path: String,
    pub iteration: u32,
    pub gate: QaGate,
    pub verdict: QaVerdict,
    pub recorded_at: DateTime<Utc>,
}
