//! Story state machine.
//!
//! For each story of the epic, in order:
//!
//! ```text
//! PREP -> IMPL -> QUALITY -> TEST_AUTO -> QA -> DONE
//!           ^        |           |        |
//!           +--------+-----------+--------+   (retry, iteration + 1)
//! ```
//!
//! Entering a phase persists `{phase, RUNNING}`; a successful outcome
//! persists `{OK}`; a failed outcome either retries from IMPL or persists
//! `{FAILED, FAILED, error}`. The driver is the only writer to the store:
//! agent records and QA verdicts come back in the outcome and are written
//! here.

pub mod report;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::agents::{AgentSet, Outcome, PhaseArtifacts, StoryTask};
use crate::config::DriverConfig;
use crate::epic::{Epic, EpicStory};
use crate::process::ProcessRunner;
use crate::store::{StateStore, StoreResult};
use crate::story::{Phase, PhasePlan, Story, StoryStatus, StoryUpdate};

pub use report::{RunReport, StoryOutcome, StorySummary};

/// Where a story with an earlier record picks up.
///
/// A RUNNING or OK story resumes at its recorded phase. The verification
/// phases depend on each other's in-memory results, so a story recorded in
/// QUALITY, TEST_AUTO or QA restarts at the first verification phase of the
/// current plan. `None` means start over at PREP.
pub fn resume_phase(plan: &PhasePlan, story: &Story) -> Option<Phase> {
    if story.phase.is_terminal()
        || !matches!(story.status, StoryStatus::Running | StoryStatus::Ok)
    {
        return None;
    }
    let phase = if story.phase.is_retryable() {
        plan.next(Phase::Impl)
    } else if story.status == StoryStatus::Ok {
        plan.next(story.phase)
    } else {
        story.phase
    };
    Some(phase)
}

async fn cancellation(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: no cancellation can arrive any more.
            std::future::pending::<()>().await;
        }
    }
}

enum StepResult {
    Finished(StorySummary),
    Cancelled(StorySummary),
}

/// Runs every story of an epic through the phase sequence.
pub struct Driver {
    config: DriverConfig,
    plan: PhasePlan,
    store: StateStore,
    agents: AgentSet,
    cancel: watch::Receiver<bool>,
}

impl Driver {
    pub fn new(config: DriverConfig, store: StateStore, agents: AgentSet) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self {
            plan: PhasePlan::new(config.skip_quality, config.skip_tests),
            config,
            store,
            agents,
            cancel,
        }
    }

    /// Driver with the production agents backed by real subprocesses.
    pub fn standard(config: DriverConfig, store: StateStore) -> Self {
        let runner = Arc::new(ProcessRunner::new(config.timeouts.kill_grace));
        let agents = AgentSet::standard(&config, runner);
        Self::new(config, store, agents)
    }

    /// Stop at the next suspension point once `cancel` turns true.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn may_retry(&self, phase: Phase, iteration: u32) -> bool {
        phase.is_retryable() && self.config.retry && iteration + 1 < self.config.max_iterations
    }

    /// Process the epic's stories in order.
    pub async fn run(&self, epic: &Epic) -> RunReport {
        let mut report = RunReport::default();
        info!(epic = %epic.path.display(), stories = epic.stories.len(), "driver started");

        for entry in &epic.stories {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let summary = match self.process_story(epic, entry).await {
                Ok(StepResult::Finished(summary)) => summary,
                Ok(StepResult::Cancelled(summary)) => {
                    warn!(story = %summary.story_path, phase = %summary.phase, "run cancelled; story left resumable");
                    report.stories.push(summary);
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    let key = entry.story_path.display().to_string();
                    error!(story = %key, error = %err, "state store failure");
                    let message = format!("state store error: {err}");
                    let marked = self
                        .store
                        .update_story(&key, StoryUpdate::failed(&message))
                        .await;
                    if let Err(mark_err) = marked {
                        warn!(story = %key, error = %mark_err, "could not mark story failed");
                    }
                    StorySummary {
                        story_id: entry.story_id.clone(),
                        story_path: key,
                        phase: Phase::Failed,
                        status: StoryStatus::Failed,
                        iteration: 0,
                        outcome: StoryOutcome::Failed,
                        gate: None,
                        error: Some(message),
                    }
                }
            };

            let failed = summary.outcome == StoryOutcome::Failed;
            report.stories.push(summary);
            if failed && self.config.halt_on_failure {
                warn!("halting after failed story");
                report.halted = true;
                break;
            }
        }

        info!(
            done = report.done_count(),
            failed = report.failed_count(),
            cancelled = report.cancelled,
            "driver finished"
        );
        report
    }

    async fn process_story(&self, epic: &Epic, entry: &EpicStory) -> StoreResult<StepResult> {
        let key = entry.story_path.display().to_string();
        let epic_id = epic.epic_id();

        let existing = self.store.get_story(&key).await?;
        let resumed = match &existing {
            Some(story) if story.is_done() => {
                info!(story = %key, "already done; skipping");
                return Ok(StepResult::Finished(StorySummary::from_story(
                    story,
                    StoryOutcome::AlreadyDone,
                )));
            }
            Some(story) => resume_phase(&self.plan, story).map(|phase| (phase, story.iteration)),
            None => None,
        };
        if let Some((phase, iteration)) = resumed {
            info!(story = %key, phase = %phase, iteration, "resuming story");
        }
        let (mut phase, mut iteration) = resumed.unwrap_or((Phase::Prep, 0));

        let mut task = StoryTask::new(&entry.story_id, &entry.story_path, &epic_id)
            .with_title(&entry.title)
            .with_iteration(iteration);
        task.metadata = entry.metadata.clone();

        let mut pending = StoryUpdate::new().with_identity(&entry.story_id, &epic_id);
        if resumed.is_none() {
            pending = pending.clear_error();
        }

        loop {
            if self.is_cancelled() {
                return Ok(StepResult::Cancelled(self.in_flight(entry, &key, phase, iteration)));
            }

            let Some(agent) = self.agents.get(phase).cloned() else {
                break;
            };

            info!(story = %key, phase = %phase, iteration, "entering phase");
            let mut enter = std::mem::take(&mut pending);
            enter.phase = Some(phase);
            enter.status = Some(StoryStatus::Running);
            enter.iteration = Some(iteration);
            self.store.update_story(&key, enter).await?;

            let outcome = tokio::select! {
                outcome = agent.execute(&task) => outcome,
                _ = cancellation(self.cancel.clone()) => {
                    return Ok(StepResult::Cancelled(self.in_flight(entry, &key, phase, iteration)));
                }
            };
            self.persist_outcome(&key, iteration, &outcome).await?;

            if outcome.success {
                self.store
                    .update_story(&key, StoryUpdate::new().with_status(StoryStatus::Ok))
                    .await?;
                task.artifacts.absorb(&outcome.details);
                phase = self.plan.next(phase);
                if phase == Phase::Done {
                    break;
                }
                continue;
            }

            let reason = outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("{phase} failed"));
            if self.may_retry(phase, iteration) {
                warn!(story = %key, phase = %phase, iteration, error = %reason, "phase failed; retrying from IMPL");
                iteration += 1;
                phase = Phase::Impl;
                task.iteration = iteration;
                task.artifacts = PhaseArtifacts::default();
                pending = StoryUpdate::new().with_error(reason);
                continue;
            }

            warn!(story = %key, phase = %phase, iteration, error = %reason, "story failed");
            let story = self
                .store
                .update_story(&key, StoryUpdate::failed(reason))
                .await?;
            return Ok(StepResult::Finished(StorySummary::from_story(
                &story,
                StoryOutcome::Failed,
            )));
        }

        let story = self
            .store
            .update_story(
                &key,
                StoryUpdate::new()
                    .with_phase(Phase::Done)
                    .with_status(StoryStatus::Ok)
                    .clear_error(),
            )
            .await?;
        info!(story = %key, iteration = story.iteration, "story done");
        Ok(StepResult::Finished(StorySummary::from_story(
            &story,
            StoryOutcome::Done,
        )))
    }

    /// Write the records and QA verdict carried by an outcome.
    async fn persist_outcome(&self, key: &str, iteration: u32, outcome: &Outcome) -> StoreResult<()> {
        if !outcome.quality_records.is_empty() {
            self.store
                .upsert_quality_records(outcome.quality_records.clone())
                .await?;
        }
        if !outcome.test_records.is_empty() {
            self.store
                .upsert_test_records(outcome.test_records.clone())
                .await?;
        }
        if let Some(verdict) = outcome.details.qa_verdict() {
            self.store
                .record_qa_review(key, iteration, verdict.clone())
                .await?;
        }
        Ok(())
    }

    fn in_flight(&self, entry: &EpicStory, key: &str, phase: Phase, iteration: u32) -> StorySummary {
        StorySummary {
            story_id: entry.story_id.clone(),
            story_path: key.to_string(),
            phase,
            status: StoryStatus::Running,
            iteration,
            outcome: StoryOutcome::Cancelled,
            gate: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{PhaseAgent, PhaseReport};
    use crate::store::{FixStatus, QualityRecord};
    use crate::verdict::{QaGate, QaVerdict};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Succeeds, or fails, in the scripted order; succeeds once the script
    /// runs out.
    struct ScriptedAgent {
        phase: Phase,
        script: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl ScriptedAgent {
        fn new(phase: Phase, script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                phase,
                script: Mutex::new(script.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn verdict(gate: QaGate) -> QaVerdict {
        QaVerdict {
            gate,
            status_reason: "scripted".to_string(),
            quality_score: if gate == QaGate::Fail { 40 } else { 100 },
            reviewer: "scripted".to_string(),
            top_issues: Vec::new(),
            nfr_validation: BTreeMap::new(),
            recommendations: Vec::new(),
        }
    }

    #[async_trait]
    impl PhaseAgent for ScriptedAgent {
        fn phase(&self) -> Phase {
            self.phase
        }

        async fn execute(&self, task: &StoryTask) -> Outcome {
            self.calls
                .lock()
                .unwrap()
                .push((task.story_id.clone(), task.iteration));
            let success = self.script.lock().unwrap().pop_front().unwrap_or(true);
            let details = if self.phase == Phase::Qa {
                PhaseReport::Qa(verdict(if success { QaGate::Pass } else { QaGate::Fail }))
            } else {
                PhaseReport::Empty
            };
            let outcome = if success {
                Outcome::success(details)
            } else {
                Outcome::failure(details, format!("{} scripted failure", self.phase))
            };
            if self.phase == Phase::Quality {
                let record = QualityRecord::new(&task.epic_id, task.story_key(), "src/app.py")
                    .with_error_count(1)
                    .with_fix_status(FixStatus::Deferred);
                return outcome.with_quality_records(vec![record]);
            }
            outcome
        }
    }

    /// Sets the cancellation flag, then never finishes.
    struct CancellingAgent {
        cancel: watch::Sender<bool>,
    }

    #[async_trait]
    impl PhaseAgent for CancellingAgent {
        fn phase(&self) -> Phase {
            Phase::TestAuto
        }

        async fn execute(&self, _task: &StoryTask) -> Outcome {
            let _ = self.cancel.send(true);
            std::future::pending::<Outcome>().await
        }
    }

    struct Harness {
        _dir: TempDir,
        store: StateStore,
        epic: Epic,
        qa: Arc<ScriptedAgent>,
        agents: AgentSet,
    }

    fn harness(ids: &[&str], qa_script: &[bool]) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("progress.db"), dir.path().join("backups")).unwrap();
        let epic = Epic {
            title: "Epic 1".to_string(),
            path: dir.path().join("epic.md"),
            stories: ids
                .iter()
                .enumerate()
                .map(|(i, id)| EpicStory {
                    story_id: id.to_string(),
                    title: format!("Story {id}"),
                    story_path: dir.path().join(format!("stories/{id}.md")),
                    metadata: BTreeMap::new(),
                    line: i + 3,
                })
                .collect(),
        };
        let qa = ScriptedAgent::new(Phase::Qa, qa_script);
        let agents = AgentSet::new(
            ScriptedAgent::new(Phase::Prep, &[]),
            ScriptedAgent::new(Phase::Impl, &[]),
            ScriptedAgent::new(Phase::Quality, &[]),
            ScriptedAgent::new(Phase::TestAuto, &[]),
            qa.clone(),
        );
        Harness {
            _dir: dir,
            store,
            epic,
            qa,
            agents,
        }
    }

    fn key(epic: &Epic, index: usize) -> String {
        epic.stories[index].story_path.display().to_string()
    }

    fn phases(history: &[crate::store::PhaseHistoryEntry]) -> Vec<Phase> {
        history.iter().map(|entry| entry.phase).collect()
    }

    #[tokio::test]
    async fn test_happy_path_reaches_done() {
        let h = harness(&["001", "002"], &[]);
        let driver = Driver::new(DriverConfig::new("epic.md"), h.store.clone(), h.agents.clone());

        let report = driver.run(&h.epic).await;
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.done_count(), 2);

        for index in 0..2 {
            let story = h.store.get_story(&key(&h.epic, index)).await.unwrap().unwrap();
            assert_eq!(story.phase, Phase::Done);
            assert_eq!(story.status, StoryStatus::Ok);
            assert_eq!(story.iteration, 0);
            assert_eq!(story.qa_result.unwrap().gate, QaGate::Pass);
        }
        let history = h.store.phase_history(&key(&h.epic, 0)).await.unwrap();
        assert_eq!(
            phases(&history),
            vec![Phase::Prep, Phase::Impl, Phase::Quality, Phase::TestAuto, Phase::Qa, Phase::Done]
        );
        assert_eq!(h.store.quality_records(&key(&h.epic, 0)).await.unwrap().len(), 1);
        assert_eq!(
            h.qa.calls(),
            vec![("001".to_string(), 0), ("002".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_skip_flags_shorten_sequence() {
        let h = harness(&["001"], &[]);
        let config = DriverConfig::new("epic.md")
            .with_skip_quality(true)
            .with_skip_tests(true);
        let report = Driver::new(config, h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;
        assert_eq!(report.exit_code(), 0);

        let history = h.store.phase_history(&key(&h.epic, 0)).await.unwrap();
        assert_eq!(phases(&history), vec![Phase::Prep, Phase::Impl, Phase::Qa, Phase::Done]);
        assert!(h.store.quality_records(&key(&h.epic, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_qa_fail_without_retry_fails_story() {
        let h = harness(&["001"], &[false]);
        let config = DriverConfig::new("epic.md").with_retry(false);
        let report = Driver::new(config, h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;
        assert_eq!(report.exit_code(), 1);

        let story = h.store.get_story(&key(&h.epic, 0)).await.unwrap().unwrap();
        assert_eq!(story.phase, Phase::Failed);
        assert_eq!(story.status, StoryStatus::Failed);
        assert_eq!(story.iteration, 0);
        assert_eq!(story.qa_result.unwrap().gate, QaGate::Fail);
        assert!(story.last_error.unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_qa_fail_then_pass_retries_once() {
        let h = harness(&["001"], &[false, true]);
        let config = DriverConfig::new("epic.md").with_max_iterations(3);
        let report = Driver::new(config, h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;
        assert_eq!(report.exit_code(), 0);

        let story = h.store.get_story(&key(&h.epic, 0)).await.unwrap().unwrap();
        assert_eq!(story.phase, Phase::Done);
        assert_eq!(story.iteration, 1);
        assert!(story.last_error.is_none());

        let reviews = h.store.qa_reviews(&key(&h.epic, 0)).await.unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].gate, QaGate::Fail);
        assert_eq!(reviews[1].iteration, 1);

        let history = h.store.phase_history(&key(&h.epic, 0)).await.unwrap();
        let second: Vec<Phase> = history
            .iter()
            .filter(|entry| entry.iteration == 1)
            .map(|entry| entry.phase)
            .collect();
        assert_eq!(second, vec![Phase::Impl, Phase::Quality, Phase::TestAuto, Phase::Qa, Phase::Done]);
    }

    #[tokio::test]
    async fn test_iterations_are_bounded() {
        let h = harness(&["001"], &[false, false, false, false]);
        let config = DriverConfig::new("epic.md").with_max_iterations(2);
        let report = Driver::new(config, h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;
        assert_eq!(report.exit_code(), 1);

        let story = h.store.get_story(&key(&h.epic, 0)).await.unwrap().unwrap();
        assert_eq!(story.phase, Phase::Failed);
        assert_eq!(story.iteration, 1);
        assert_eq!(h.qa.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_stories_unless_halting() {
        let h = harness(&["001", "002"], &[false]);
        let config = DriverConfig::new("epic.md").with_retry(false);
        let report = Driver::new(config.clone(), h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;
        assert_eq!(report.stories.len(), 2);
        assert_eq!(report.stories[1].outcome, StoryOutcome::Done);

        let h = harness(&["001", "002"], &[false]);
        let report = Driver::new(config.with_halt_on_failure(true), h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;
        assert!(report.halted);
        assert_eq!(report.stories.len(), 1);
        assert!(h.store.get_story(&key(&h.epic, 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_done_story_is_skipped() {
        let h = harness(&["001"], &[]);
        let driver = Driver::new(DriverConfig::new("epic.md"), h.store.clone(), h.agents.clone());
        driver.run(&h.epic).await;
        let report = driver.run(&h.epic).await;

        assert_eq!(report.stories[0].outcome, StoryOutcome::AlreadyDone);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(h.qa.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_story_running_and_resumable() {
        let h = harness(&["001", "002"], &[]);
        let (tx, rx) = watch::channel(false);
        let agents = h.agents.clone().with_agent(Arc::new(CancellingAgent { cancel: tx }));
        let report = Driver::new(DriverConfig::new("epic.md"), h.store.clone(), agents)
            .with_cancellation(rx)
            .run(&h.epic)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.stories.len(), 1);
        let story = h.store.get_story(&key(&h.epic, 0)).await.unwrap().unwrap();
        assert_eq!(story.phase, Phase::TestAuto);
        assert_eq!(story.status, StoryStatus::Running);
        assert!(!h.store.get_health().lock_held);

        // Next run resumes at the first verification phase.
        let report = Driver::new(DriverConfig::new("epic.md"), h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;
        assert_eq!(report.exit_code(), 0);
        let history = h.store.phase_history(&key(&h.epic, 0)).await.unwrap();
        assert_eq!(
            phases(&history),
            vec![
                Phase::Prep,
                Phase::Impl,
                Phase::Quality,
                Phase::TestAuto,
                Phase::Quality,
                Phase::TestAuto,
                Phase::Qa,
                Phase::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_story_restarts_at_prep() {
        let h = harness(&["001"], &[false]);
        let config = DriverConfig::new("epic.md").with_retry(false);
        Driver::new(config.clone(), h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;
        let report = Driver::new(config, h.store.clone(), h.agents.clone())
            .run(&h.epic)
            .await;

        assert_eq!(report.exit_code(), 0);
        let story = h.store.get_story(&key(&h.epic, 0)).await.unwrap().unwrap();
        assert_eq!(story.phase, Phase::Done);
        assert_eq!(story.iteration, 0);
        let history = h.store.phase_history(&key(&h.epic, 0)).await.unwrap();
        assert_eq!(history.iter().filter(|e| e.phase == Phase::Prep).count(), 2);
    }

    #[test]
    fn test_resume_phase_rules() {
        let plan = PhasePlan::new(true, false);
        let mut story = Story::new("s.md", "1", "e.md");

        story.phase = Phase::Impl;
        story.status = StoryStatus::Running;
        assert_eq!(resume_phase(&plan, &story), Some(Phase::Impl));

        story.status = StoryStatus::Ok;
        assert_eq!(resume_phase(&plan, &story), Some(Phase::TestAuto));

        story.phase = Phase::Qa;
        story.status = StoryStatus::Running;
        assert_eq!(resume_phase(&plan, &story), Some(Phase::TestAuto));

        story.phase = Phase::Failed;
        story.status = StoryStatus::Failed;
        assert_eq!(resume_phase(&plan, &story), None);

        story.phase = Phase::Prep;
        story.status = StoryStatus::Pending;
        assert_eq!(resume_phase(&plan, &story), None);
    }
}
