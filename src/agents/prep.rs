//! Story preparation.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::{Outcome, PhaseAgent, PhaseReport, StoryTask};
use crate::story::Phase;

/// Status line value that marks a story ready for implementation.
pub const READY_STATUS: &str = "Ready for Development";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepSummary {
    pub story_path: String,
    /// The story file was written from the template
    pub created: bool,
    /// An existing story file had its status line changed
    pub status_updated: bool,
}

fn status_line_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^(\**status\**\s*:\s*)(.*)$").ok())
        .as_ref()
}

/// Initial content for a story file that does not exist yet.
pub fn story_template(task: &StoryTask) -> String {
    let title = if task.title.is_empty() {
        format!("Story {}", task.story_id)
    } else {
        format!("Story {}: {}", task.story_id, task.title)
    };
    let mut content = format!("# {title}\n\nStatus: {READY_STATUS}\n\n## Story\n\n");
    if let Some(description) = task.metadata.get("description") {
        content.push_str(description);
        content.push_str("\n\n");
    }
    content.push_str("## Acceptance Criteria\n\n## Tasks\n\n## Dev Notes\n");
    content
}

/// Set the status line to [`READY_STATUS`], inserting one after the first
/// heading when there is none. Returns `None` when nothing changes.
pub fn mark_ready(content: &str) -> Option<String> {
    if let Some(re) = status_line_re() {
        if let Some(caps) = re.captures(content) {
            if caps[2].trim() == READY_STATUS {
                return None;
            }
            let replaced = re.replace(content, |caps: &regex::Captures| {
                format!("{}{READY_STATUS}", &caps[1])
            });
            return Some(replaced.into_owned());
        }
    }

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let status = format!("Status: {READY_STATUS}");
    match lines.iter().position(|line| line.starts_with('#')) {
        Some(heading) => {
            lines.splice(heading + 1..heading + 1, [String::new(), status]);
        }
        None => lines.insert(0, status),
    }
    let mut updated = lines.join("\n");
    updated.push('\n');
    Some(updated)
}

/// Materializes the story file and marks it ready for implementation.
#[derive(Debug, Clone, Default)]
pub struct PrepAgent;

impl PrepAgent {
    pub fn new() -> Self {
        Self
    }

    async fn prepare(&self, task: &StoryTask) -> std::io::Result<PrepSummary> {
        let path = task.story_path.as_path();
        let mut summary = PrepSummary {
            story_path: path.display().to_string(),
            ..PrepSummary::default()
        };

        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            if let Some(updated) = mark_ready(&content) {
                tokio::fs::write(path, updated).await?;
                summary.status_updated = true;
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, story_template(task)).await?;
            summary.created = true;
        }
        Ok(summary)
    }
}

#[async_trait]
impl PhaseAgent for PrepAgent {
    fn phase(&self) -> Phase {
        Phase::Prep
    }

    async fn execute(&self, task: &StoryTask) -> Outcome {
        match self.prepare(task).await {
            Ok(summary) => {
                if summary.created {
                    info!(story = %summary.story_path, "story file created");
                } else {
                    debug!(story = %summary.story_path, updated = summary.status_updated, "story file ready");
                }
                Outcome::success(PhaseReport::Prep(summary))
            }
            Err(err) => Outcome::failure(
                PhaseReport::Empty,
                format!("failed to prepare {}: {err}", task.story_path.display()),
            ),
        }
    }
}
