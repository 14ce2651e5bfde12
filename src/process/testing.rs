//! Scripted [`CommandRunner`] for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommandOutput, CommandRunner, CommandSpec, ToolError};

type Handler = dyn Fn(&CommandSpec) -> Result<CommandOutput, ToolError> + Send + Sync;

/// Answers every command with the handler's result and records the calls.
pub(crate) struct FakeRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, ToolError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
        self.calls.lock().unwrap().push(spec.clone());
        (self.handler)(spec)
    }
}

pub(crate) fn output(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        ..CommandOutput::default()
    }
}

pub(crate) fn not_found(spec: &CommandSpec) -> ToolError {
    ToolError::NotFound {
        program: spec.program.clone(),
    }
}
