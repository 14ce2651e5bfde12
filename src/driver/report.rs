//! Per-story summaries and the run report printed at the end.

use std::fmt::Write as _;

use owo_colors::OwoColorize;

use crate::error::{EXIT_STORY_FAILED, EXIT_SUCCESS};
use crate::story::{Phase, Story, StoryStatus};
use crate::verdict::QaGate;

/// How processing of one story ended in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryOutcome {
    /// Reached DONE in this run
    Done,
    /// Already DONE in an earlier run; nothing was executed
    AlreadyDone,
    Failed,
    /// The run was cancelled while the story was in flight
    Cancelled,
}

impl StoryOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, StoryOutcome::Done | StoryOutcome::AlreadyDone)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorySummary {
    pub story_id: String,
    pub story_path: String,
    pub phase: Phase,
    pub status: StoryStatus,
    pub iteration: u32,
    pub outcome: StoryOutcome,
    pub gate: Option<QaGate>,
    pub error: Option<String>,
}

impl StorySummary {
    pub fn from_story(story: &Story, outcome: StoryOutcome) -> Self {
        Self {
            story_id: story.story_id.clone(),
            story_path: story.story_path.clone(),
            phase: story.phase,
            status: story.status,
            iteration: story.iteration,
            outcome,
            gate: story.qa_result.as_ref().map(|v| v.gate),
            error: story.last_error.clone(),
        }
    }

    /// One summary line: id, phase reached, status and iteration count.
    pub fn render(&self, color: bool) -> String {
        let phase = format!("{:<9}", self.phase.as_str());
        let status = format!("{:<7}", self.status.as_str());
        let (phase, status) = if !color {
            (phase, status)
        } else {
            match self.outcome {
                StoryOutcome::Done | StoryOutcome::AlreadyDone => {
                    (phase.green().to_string(), status.green().to_string())
                }
                StoryOutcome::Failed => (phase.red().to_string(), status.red().bold().to_string()),
                StoryOutcome::Cancelled => (phase.yellow().to_string(), status.yellow().to_string()),
            }
        };

        let mut line = format!(
            "{:<10} {phase} {status} iteration={}",
            self.story_id, self.iteration
        );
        if let Some(gate) = self.gate {
            let _ = write!(line, " gate={gate}");
        }
        if self.outcome == StoryOutcome::AlreadyDone {
            line.push_str(" (already done)");
        }
        if self.outcome == StoryOutcome::Failed {
            if let Some(error) = &self.error {
                let error = if color {
                    error.dimmed().to_string()
                } else {
                    error.clone()
                };
                let _ = write!(line, " error: {error}");
            }
        }
        line
    }
}

/// Result of a whole driver run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// One entry per story processed, in epic order
    pub stories: Vec<StorySummary>,
    pub cancelled: bool,
    /// Processing stopped after a failure with halt-on-failure set
    pub halted: bool,
}

impl RunReport {
    pub fn done_count(&self) -> usize {
        self.stories.iter().filter(|s| s.outcome.is_done()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.stories
            .iter()
            .filter(|s| s.outcome == StoryOutcome::Failed)
            .count()
    }

    pub fn all_done(&self) -> bool {
        !self.cancelled && !self.halted && self.stories.iter().all(|s| s.outcome.is_done())
    }

    /// 0 when every story reached DONE, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_done() {
            EXIT_SUCCESS
        } else {
            EXIT_STORY_FAILED
        }
    }

    pub fn render(&self, color: bool) -> String {
        let mut out = String::new();
        for story in &self.stories {
            out.push_str(&story.render(color));
            out.push('\n');
        }
        let _ = write!(
            out,
            "{} stories: {} done, {} failed",
            self.stories.len(),
            self.done_count(),
            self.failed_count()
        );
        if self.cancelled {
            out.push_str(", cancelled");
        }
        if self.halted {
            out.push_str(", halted after failure");
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(outcome: StoryOutcome) -> StorySummary {
        let mut story = Story::new("/repo/stories/001.md", "001", "/repo/epic.md");
        story.phase = if outcome == StoryOutcome::Failed {
            Phase::Failed
        } else {
            Phase::Done
        };
        story.status = if outcome == StoryOutcome::Failed {
            StoryStatus::Failed
        } else {
            StoryStatus::Ok
        };
        story.last_error = Some("QA gate FAIL".to_string());
        StorySummary::from_story(&story, outcome)
    }

    #[test]
    fn test_exit_code_requires_every_story_done() {
        let mut report = RunReport {
            stories: vec![summary(StoryOutcome::Done), summary(StoryOutcome::AlreadyDone)],
            ..RunReport::default()
        };
        assert_eq!(report.exit_code(), 0);

        report.stories.push(summary(StoryOutcome::Failed));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failed_count(), 1);
    }

    #[test]
    fn test_cancelled_run_is_not_success() {
        let report = RunReport {
            stories: vec![summary(StoryOutcome::Done)],
            cancelled: true,
            halted: false,
        };
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_empty_run_succeeds() {
        assert_eq!(RunReport::default().exit_code(), 0);
    }

    #[test]
    fn test_plain_render() {
        let line = summary(StoryOutcome::Failed).render(false);
        assert!(line.starts_with("001"));
        assert!(line.contains("FAILED"));
        assert!(line.contains("iteration=0"));
        assert!(line.contains("error: QA gate FAIL"));

        let done = summary(StoryOutcome::Done).render(false);
        assert!(!done.contains("error"));
    }
}
