//! Phase agents.
//!
//! Each phase of the story state machine is carried out by one
//! [`PhaseAgent`]. Agents never touch the state store: everything they want
//! persisted (phase records, the QA verdict) travels back to the driver in
//! the [`Outcome`]. Agents never return errors either; a failure is an
//! outcome with `success = false` and a reason.

pub mod implementation;
pub mod prep;
pub mod qa;
pub mod quality;
pub mod test_automation;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::classify::ErrorClassifier;
use crate::config::DriverConfig;
use crate::process::CommandRunner;
use crate::scheduler::TestBatchScheduler;
use crate::store::{QualityRecord, TestPhaseRecord};
use crate::story::Phase;
use crate::tools::{LintIntegrator, TestRunIntegrator, TypeCheckIntegrator};
use crate::verdict::QaVerdict;

pub use implementation::{ImplementationAgent, ImplementationSummary};
pub use prep::{PrepAgent, PrepSummary, READY_STATUS};
pub use qa::{QaAgent, QaInputs, REVIEWER};
pub use quality::{QualityAgent, QualitySummary, ToolSummary};
pub use test_automation::{TestAutomationAgent, TestAutomationSummary};

/// Results of earlier phases in the current iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseArtifacts {
    pub modified_files: Vec<PathBuf>,
    pub quality: Option<QualitySummary>,
    pub tests: Option<TestAutomationSummary>,
}

impl PhaseArtifacts {
    /// Fold a phase report into the artifacts.
    pub fn absorb(&mut self, report: &PhaseReport) {
        match report {
            PhaseReport::Implementation(summary) => {
                self.modified_files = summary.modified_files.clone();
            }
            PhaseReport::Quality(summary) => self.quality = Some(summary.clone()),
            PhaseReport::TestAutomation(summary) => self.tests = Some(summary.clone()),
            PhaseReport::Prep(_) | PhaseReport::Qa(_) | PhaseReport::Empty => {}
        }
    }
}

/// What an agent is asked to work on.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryTask {
    pub story_id: String,
    pub title: String,
    pub story_path: PathBuf,
    pub epic_id: String,
    pub metadata: BTreeMap<String, String>,
    pub iteration: u32,
    pub artifacts: PhaseArtifacts,
}

impl StoryTask {
    pub fn new(story_id: impl Into<String>, story_path: impl Into<PathBuf>, epic_id: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            title: String::new(),
            story_path: story_path.into(),
            epic_id: epic_id.into(),
            metadata: BTreeMap::new(),
            iteration: 0,
            artifacts: PhaseArtifacts::default(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_artifacts(mut self, artifacts: PhaseArtifacts) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Store key of the story.
    pub fn story_key(&self) -> String {
        self.story_path.display().to_string()
    }
}

/// Phase-specific details of an outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseReport {
    Prep(PrepSummary),
    Implementation(ImplementationSummary),
    Quality(QualitySummary),
    TestAutomation(TestAutomationSummary),
    Qa(QaVerdict),
    /// The agent stopped before producing anything
    Empty,
}

impl PhaseReport {
    pub fn qa_verdict(&self) -> Option<&QaVerdict> {
        match self {
            PhaseReport::Qa(verdict) => Some(verdict),
            _ => None,
        }
    }
}

/// Result of one agent execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub details: PhaseReport,
    pub error: Option<String>,
    /// Records the driver persists for the QUALITY phase
    pub quality_records: Vec<QualityRecord>,
    /// Records the driver persists for the TEST_AUTO phase
    pub test_records: Vec<TestPhaseRecord>,
}

impl Outcome {
    pub fn success(details: PhaseReport) -> Self {
        Self {
            success: true,
            details,
            error: None,
            quality_records: Vec::new(),
            test_records: Vec::new(),
        }
    }

    pub fn failure(details: PhaseReport, error: impl Into<String>) -> Self {
        Self {
            success: false,
            details,
            error: Some(error.into()),
            quality_records: Vec::new(),
            test_records: Vec::new(),
        }
    }

    pub fn with_quality_records(mut self, records: Vec<QualityRecord>) -> Self {
        self.quality_records = records;
        self
    }

    pub fn with_test_records(mut self, records: Vec<TestPhaseRecord>) -> Self {
        self.test_records = records;
        self
    }
}

/// Outcome of a tool-backed check, as summarized for later phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Clean,
    Issues,
    ToolMissing,
    ToolError,
}

/// One phase of the state machine.
#[async_trait]
pub trait PhaseAgent: Send + Sync {
    /// The phase this agent carries out.
    fn phase(&self) -> Phase;

    async fn execute(&self, task: &StoryTask) -> Outcome;
}

/// The five agents, one per working phase.
#[derive(Clone)]
pub struct AgentSet {
    prep: Arc<dyn PhaseAgent>,
    implementation: Arc<dyn PhaseAgent>,
    quality: Arc<dyn PhaseAgent>,
    test_automation: Arc<dyn PhaseAgent>,
    qa: Arc<dyn PhaseAgent>,
}

impl AgentSet {
    pub fn new(
        prep: Arc<dyn PhaseAgent>,
        implementation: Arc<dyn PhaseAgent>,
        quality: Arc<dyn PhaseAgent>,
        test_automation: Arc<dyn PhaseAgent>,
        qa: Arc<dyn PhaseAgent>,
    ) -> Self {
        Self {
            prep,
            implementation,
            quality,
            test_automation,
            qa,
        }
    }

    /// The production agents, wired to `runner` and configured from `config`.
    pub fn standard(config: &DriverConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let timeouts = &config.timeouts;
        let tests = TestRunIntegrator::new(runner.clone(), &config.tools.test_runner);

        let type_check = TypeCheckIntegrator::new(
            runner.clone(),
            &config.tools.type_checker,
            timeouts.type_check_timeout,
        );
        let lint = LintIntegrator::new(runner.clone(), &config.tools.linter, timeouts.lint_timeout);
        let scheduler = TestBatchScheduler::new(tests.clone(), &config.test_dir)
            .with_coverage_source(&config.source_dir)
            .with_batch_grace(timeouts.batch_grace)
            .with_verbose(true);

        let mut implementation = ImplementationAgent::new(
            runner,
            vec![config.source_dir.clone(), config.test_dir.clone()],
        )
        .with_python(&config.tools.python)
        .with_test_runner(tests)
        .with_validate(config.validate)
        .with_timeouts(timeouts.agent_timeout, timeouts.validation_timeout);
        if let Some(command) = &config.agent_command {
            implementation = implementation.with_agent_command(command);
        }

        let mut qa = QaAgent::new();
        if let Some(reason) = &config.waiver {
            qa = qa.with_waiver(reason);
        }

        Self::new(
            Arc::new(PrepAgent::new()),
            Arc::new(implementation),
            Arc::new(QualityAgent::new(
                type_check,
                lint,
                ErrorClassifier::new(config.confidence_threshold),
                &config.source_dir,
            )),
            Arc::new(TestAutomationAgent::new(scheduler)),
            Arc::new(qa),
        )
    }

    /// Replace the agent for `agent.phase()`.
    pub fn with_agent(mut self, agent: Arc<dyn PhaseAgent>) -> Self {
        match agent.phase() {
            Phase::Prep => self.prep = agent,
            Phase::Impl => self.implementation = agent,
            Phase::Quality => self.quality = agent,
            Phase::TestAuto => self.test_automation = agent,
            Phase::Qa => self.qa = agent,
            Phase::Done | Phase::Failed => {}
        }
        self
    }

    /// Agent for a working phase; `None` for DONE and FAILED.
    pub fn get(&self, phase: Phase) -> Option<&Arc<dyn PhaseAgent>> {
        match phase {
            Phase::Prep => Some(&self.prep),
            Phase::Impl => Some(&self.implementation),
            Phase::Quality => Some(&self.quality),
            Phase::TestAuto => Some(&self.test_automation),
            Phase::Qa => Some(&self.qa),
            Phase::Done | Phase::Failed => None,
        }
    }
}
