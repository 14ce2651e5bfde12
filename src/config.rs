//! Driver configuration.
//!
//! Everything except the state-store location comes from the command line;
//! the store path is read from [`STORE_PATH_ENV_VAR`].

use std::env;
use std::path::{Path, PathBuf};

use crate::error::DriverError;
use crate::timeout::TimeoutConfig;

/// Environment variable naming the state-store file.
pub const STORE_PATH_ENV_VAR: &str = "EPIC_DRIVER_DB";

/// Default state-store file name, relative to the working directory.
pub const DEFAULT_STORE_FILE: &str = "progress.db";

/// Default number of retries allowed per story.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Default confidence at which a SIMPLE diagnostic counts as auto-fixable.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Names of the external executables the integrators invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommands {
    /// Static type checker (JSON output via `--outputjson`)
    pub type_checker: String,
    /// Lint-and-fix tool (`check --output-format=json`)
    pub linter: String,
    /// Test runner
    pub test_runner: String,
    /// Interpreter used for syntax-compile validation
    pub python: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            type_checker: "pyright".to_string(),
            linter: "ruff".to_string(),
            test_runner: "pytest".to_string(),
            python: "python3".to_string(),
        }
    }
}

/// Resolve the store path: [`STORE_PATH_ENV_VAR`] if set and non-empty,
/// otherwise [`DEFAULT_STORE_FILE`] in the working directory.
pub fn store_path_from_env() -> PathBuf {
    env::var(STORE_PATH_ENV_VAR)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_FILE))
}

/// Complete configuration for one driver run.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub epic_path: PathBuf,
    pub source_dir: PathBuf,
    pub test_dir: PathBuf,
    pub store_path: PathBuf,
    pub skip_quality: bool,
    pub skip_tests: bool,
    pub retry: bool,
    pub max_iterations: u32,
    pub verbose: bool,
    /// Stop processing further stories after the first FAILED story
    pub halt_on_failure: bool,
    /// Run syntax-compile and focused-test validations after implementation
    pub validate: bool,
    /// External code-generation command, run through `sh -c`
    pub agent_command: Option<String>,
    /// Operator waiver reason turning a FAIL gate into WAIVED
    pub waiver: Option<String>,
    pub tools: ToolCommands,
    pub timeouts: TimeoutConfig,
    pub confidence_threshold: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            epic_path: PathBuf::new(),
            source_dir: PathBuf::from("src"),
            test_dir: PathBuf::from("tests"),
            store_path: PathBuf::from(DEFAULT_STORE_FILE),
            skip_quality: false,
            skip_tests: false,
            retry: true,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            verbose: false,
            halt_on_failure: false,
            validate: true,
            agent_command: None,
            waiver: None,
            tools: ToolCommands::default(),
            timeouts: TimeoutConfig::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl DriverConfig {
    /// Configuration for `epic_path` with defaults elsewhere.
    pub fn new(epic_path: impl Into<PathBuf>) -> Self {
        Self {
            epic_path: epic_path.into(),
            ..Self::default()
        }
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = dir.into();
        self
    }

    pub fn with_test_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.test_dir = dir.into();
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn with_skip_quality(mut self, skip: bool) -> Self {
        self.skip_quality = skip;
        self
    }

    pub fn with_skip_tests(mut self, skip: bool) -> Self {
        self.skip_tests = skip;
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_halt_on_failure(mut self, halt: bool) -> Self {
        self.halt_on_failure = halt;
        self
    }

    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_agent_command(mut self, command: impl Into<String>) -> Self {
        self.agent_command = Some(command.into());
        self
    }

    pub fn with_waiver(mut self, reason: impl Into<String>) -> Self {
        self.waiver = Some(reason.into());
        self
    }

    pub fn with_tools(mut self, tools: ToolCommands) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Directory holding store backups (`backups/` next to the store file).
    pub fn backup_dir(&self) -> PathBuf {
        backup_dir_for(&self.store_path)
    }

    /// Check that the inputs exist before any story is processed.
    pub fn validate(&self) -> Result<(), DriverError> {
        if !self.epic_path.is_file() {
            return Err(DriverError::Config(format!(
                "epic document not found: {}",
                self.epic_path.display()
            )));
        }
        if !self.source_dir.is_dir() {
            return Err(DriverError::Config(format!(
                "source directory not found: {}",
                self.source_dir.display()
            )));
        }
        if !self.skip_tests && !self.test_dir.is_dir() {
            return Err(DriverError::Config(format!(
                "test directory not found: {}",
                self.test_dir.display()
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(DriverError::Config(format!(
                "confidence threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

/// `backups/` directory sibling to a store file.
pub fn backup_dir_for(store_path: &Path) -> PathBuf {
    match store_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join("backups"),
        _ => PathBuf::from("backups"),
    }
}
