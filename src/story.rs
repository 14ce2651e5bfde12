//! Story state model.
//!
//! A story is the unit of work the driver advances through the phase
//! sequence. Its durable form lives in the `stories` table; this module
//! defines the phase/status enums, the row type and the partial update
//! applied by [`crate::store::StateStore::update_story`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::verdict::QaVerdict;

/// A state in the per-story state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Story file preparation
    Prep,
    /// Code generation / modification
    Impl,
    /// Type-check and lint gates
    Quality,
    /// Test batch execution
    TestAuto,
    /// QA adjudication
    Qa,
    /// Terminal success state
    Done,
    /// Terminal failure state
    Failed,
}

impl Phase {
    /// Stable label used in the store and in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prep => "PREP",
            Phase::Impl => "IMPL",
            Phase::Quality => "QUALITY",
            Phase::TestAuto => "TEST_AUTO",
            Phase::Qa => "QA",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
        }
    }

    /// Whether the phase ends processing of the story.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Whether a failed outcome in this phase may send the story back to IMPL.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Phase::Quality | Phase::TestAuto | Phase::Qa)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREP" => Ok(Phase::Prep),
            "IMPL" => Ok(Phase::Impl),
            "QUALITY" => Ok(Phase::Quality),
            "TEST_AUTO" => Ok(Phase::TestAuto),
            "QA" => Ok(Phase::Qa),
            "DONE" => Ok(Phase::Done),
            "FAILED" => Ok(Phase::Failed),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Execution status of the story within its current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoryStatus {
    Pending,
    Running,
    Ok,
    Failed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Pending => "PENDING",
            StoryStatus::Running => "RUNNING",
            StoryStatus::Ok => "OK",
            StoryStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StoryStatus::Pending),
            "RUNNING" => Ok(StoryStatus::Running),
            "OK" => Ok(StoryStatus::Ok),
            "FAILED" => Ok(StoryStatus::Failed),
            other => Err(format!("unknown story status: {other}")),
        }
    }
}

/// The phase sequence after applying the skip flags.
///
/// The full sequence is PREP → IMPL → QUALITY → TEST_AUTO → QA → DONE;
/// `skip_quality` removes QUALITY and `skip_tests` removes TEST_AUTO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhasePlan {
    pub skip_quality: bool,
    pub skip_tests: bool,
}

impl PhasePlan {
    pub fn new(skip_quality: bool, skip_tests: bool) -> Self {
        Self {
            skip_quality,
            skip_tests,
        }
    }

    /// Whether the phase is part of this plan.
    pub fn includes(&self, phase: Phase) -> bool {
        match phase {
            Phase::Quality => !self.skip_quality,
            Phase::TestAuto => !self.skip_tests,
            _ => true,
        }
    }

    /// The phase entered after `phase` completes successfully.
    pub fn next(&self, phase: Phase) -> Phase {
        let mut candidate = match phase {
            Phase::Prep => Phase::Impl,
            Phase::Impl => Phase::Quality,
            Phase::Quality => Phase::TestAuto,
            Phase::TestAuto => Phase::Qa,
            Phase::Qa => Phase::Done,
            Phase::Done => return Phase::Done,
            Phase::Failed => return Phase::Failed,
        };
        while !self.includes(candidate) {
            candidate = self.next(candidate);
        }
        candidate
    }

    /// The ordered non-terminal phases of one full iteration, followed by DONE.
    pub fn sequence(&self) -> Vec<Phase> {
        let mut phases = vec![Phase::Prep];
        let mut current = Phase::Prep;
        while current != Phase::Done {
            current = self.next(current);
            phases.push(current);
        }
        phases
    }
}

/// Durable per-story state, one row of the `stories` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    /// Stable identity of the story (resolved story file path)
    pub story_path: String,
    /// Identifier from the epic heading (e.g. "1.2")
    pub story_id: String,
    /// Path of the epic that lists the story
    pub epic_path: String,
    pub phase: Phase,
    pub status: StoryStatus,
    /// Number of retries taken so far (0 on the first pass)
    pub iteration: u32,
    pub last_error: Option<String>,
    pub qa_result: Option<QaVerdict>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// A freshly sighted story, not yet started.
    pub fn new(
        story_path: impl Into<String>,
        story_id: impl Into<String>,
        epic_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            story_path: story_path.into(),
            story_id: story_id.into(),
            epic_path: epic_path.into(),
            phase: Phase::Prep,
            status: StoryStatus::Pending,
            iteration: 0,
            last_error: None,
            qa_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a previous run finished this story successfully.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done && self.status == StoryStatus::Ok
    }

    /// Apply a partial update in memory.
    pub fn apply(&mut self, update: &StoryUpdate) {
        if let Some(story_id) = &update.story_id {
            self.story_id = story_id.clone();
        }
        if let Some(epic_path) = &update.epic_path {
            self.epic_path = epic_path.clone();
        }
        if let Some(phase) = update.phase {
            self.phase = phase;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(iteration) = update.iteration {
            self.iteration = iteration;
        }
        if let Some(error) = &update.error {
            self.last_error = error.clone();
        }
        if let Some(verdict) = &update.qa_result {
            self.qa_result = Some(verdict.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update applied to a story row; unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoryUpdate {
    pub story_id: Option<String>,
    pub epic_path: Option<String>,
    pub phase: Option<Phase>,
    pub status: Option<StoryStatus>,
    pub iteration: Option<u32>,
    /// `Some(None)` clears the last error
    pub error: Option<Option<String>>,
    pub qa_result: Option<QaVerdict>,
}

impl StoryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entering `phase`: `{phase, status=RUNNING}`.
    pub fn enter(phase: Phase) -> Self {
        Self::new().with_phase(phase).with_status(StoryStatus::Running)
    }

    /// Terminal failure: `{phase=FAILED, status=FAILED, error}`.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::new()
            .with_phase(Phase::Failed)
            .with_status(StoryStatus::Failed)
            .with_error(error)
    }

    pub fn with_identity(mut self, story_id: impl Into<String>, epic_path: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self.epic_path = Some(epic_path.into());
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_status(mut self, status: StoryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn with_qa_result(mut self, verdict: QaVerdict) -> Self {
        self.qa_result = Some(verdict);
        self
    }
}
