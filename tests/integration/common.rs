//! Shared fixtures for the integration tests.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use epic_driver::agents::{Outcome, PhaseAgent, PhaseReport, QaAgent, StoryTask};
use epic_driver::process::{CommandOutput, CommandRunner, CommandSpec, ToolError};
use epic_driver::store::StateStore;
use epic_driver::story::Phase;
use epic_driver::verdict::QaGate;
use tempfile::TempDir;

/// A project tree with `src/`, `tests/unit/` and an epic listing `ids`.
pub struct Project {
    pub dir: TempDir,
    pub epic: PathBuf,
}

impl Project {
    pub fn new(ids: &[&str]) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(dir.path().join("src")).expect("Failed to create src");
        fs::create_dir_all(dir.path().join("tests/unit")).expect("Failed to create tests");
        fs::write(dir.path().join("src/app.py"), "def main():\n    return 0\n")
            .expect("Failed to write source");
        fs::write(
            dir.path().join("tests/unit/test_app.py"),
            "def test_main():\n    assert True\n",
        )
        .expect("Failed to write test");

        let epic = dir.path().join("epic.md");
        fs::write(&epic, epic_document(ids)).expect("Failed to write epic");
        Self { dir, epic }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_dir(&self) -> PathBuf {
        self.path().join("src")
    }

    pub fn test_dir(&self) -> PathBuf {
        self.path().join("tests")
    }

    pub fn store_path(&self) -> PathBuf {
        self.path().join("progress.db")
    }

    pub fn story_key(&self, id: &str) -> String {
        self.path()
            .join(format!("stories/{id}.md"))
            .display()
            .to_string()
    }

    pub fn open_store(&self) -> StateStore {
        StateStore::open(self.store_path(), self.path().join("backups"))
            .expect("Failed to open store")
    }
}

pub fn epic_document(ids: &[&str]) -> String {
    let mut epic = String::from("# Epic 1: Sorting service\n\n## Stories\n\n");
    for id in ids {
        epic.push_str(&format!(
            "### Story {id}: Feature {id}\n- File: stories/{id}.md\n- Description: Build feature {id}\n\n"
        ));
    }
    epic
}

type Handler = dyn Fn(&CommandSpec) -> Result<CommandOutput, ToolError> + Send + Sync;

/// Command runner answering from a closure and recording every call.
pub struct ScriptedRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, ToolError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Clean type check, clean lint, passing tests.
    pub fn healthy() -> Self {
        Self::new(|spec| {
            let stdout = match spec.program.as_str() {
                "pyright" => r#"{"generalDiagnostics": [], "summary": {"filesAnalyzed": 1}}"#,
                "ruff" => "[]",
                "pytest" => "3 passed in 0.10s",
                _ => "",
            };
            Ok(output(0, stdout))
        })
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
        self.calls.lock().unwrap().push(spec.clone());
        (self.handler)(spec)
    }
}

pub fn output(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        ..CommandOutput::default()
    }
}

/// QA agent returning scripted gates; PASS once the script runs out.
pub struct ScriptedQa {
    gates: Mutex<VecDeque<QaGate>>,
}

impl ScriptedQa {
    pub fn new(gates: &[QaGate]) -> Self {
        Self {
            gates: Mutex::new(gates.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl PhaseAgent for ScriptedQa {
    fn phase(&self) -> Phase {
        Phase::Qa
    }

    async fn execute(&self, task: &StoryTask) -> Outcome {
        let gate = self.gates.lock().unwrap().pop_front().unwrap_or(QaGate::Pass);
        let mut verdict = QaAgent::new().review(None, None);
        verdict.gate = gate;
        verdict.status_reason = format!("scripted {gate} for iteration {}", task.iteration);
        if gate.is_passing() {
            Outcome::success(PhaseReport::Qa(verdict))
        } else {
            Outcome::failure(PhaseReport::Qa(verdict), "QA gate FAIL")
        }
    }
}
