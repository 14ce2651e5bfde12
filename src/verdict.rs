//! QA verdict model.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Final QA gate category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaGate {
    Pass,
    Concerns,
    Fail,
    /// Only produced from an explicit operator waiver.
    Waived,
}

impl QaGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaGate::Pass => "PASS",
            QaGate::Concerns => "CONCERNS",
            QaGate::Fail => "FAIL",
            QaGate::Waived => "WAIVED",
        }
    }

    /// Whether the gate lets the story complete.
    pub fn is_passing(&self) -> bool {
        !matches!(self, QaGate::Fail)
    }
}

impl fmt::Display for QaGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one non-functional requirement area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NfrStatus {
    Pass,
    Concerns,
    Fail,
    NotAssessed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfrAssessment {
    pub status: NfrStatus,
    pub notes: String,
}

impl NfrAssessment {
    pub fn new(status: NfrStatus, notes: impl Into<String>) -> Self {
        Self {
            status,
            notes: notes.into(),
        }
    }
}

/// Severity of an issue surfaced in a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaIssue {
    pub severity: IssueSeverity,
    /// Area the issue came from (e.g. "type_check", "tests")
    pub source: String,
    pub description: String,
}

impl QaIssue {
    pub fn new(
        severity: IssueSeverity,
        source: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            source: source.into(),
            description: description.into(),
        }
    }
}

/// The adjudicated result of the QA phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaVerdict {
    pub gate: QaGate,
    pub status_reason: String,
    /// 0..=100
    pub quality_score: u8,
    pub reviewer: String,
    #[serde(default)]
    pub top_issues: Vec<QaIssue>,
    #[serde(default)]
    pub nfr_validation: BTreeMap<String, NfrAssessment>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}
