//! Timeout configuration for external tool invocations.
//!
//! Every subprocess the driver launches carries a whole-second timeout.
//! Test batches carry their own timeout (see [`crate::scheduler`]); the
//! per-command limit applied to a batch is the batch timeout plus
//! `batch_grace`.

use std::time::Duration;

/// Configuration for timeout behavior of tool and agent invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time allowed for one type-checker run.
    /// Default: 300 seconds
    pub type_check_timeout: Duration,

    /// Maximum time allowed for one linter run.
    /// Default: 120 seconds
    pub lint_timeout: Duration,

    /// Maximum time allowed for the code-generation agent command.
    /// Default: 1800 seconds (30 minutes)
    pub agent_timeout: Duration,

    /// Maximum time allowed for a post-implementation validation command
    /// (syntax compile, focused test run).
    /// Default: 120 seconds
    pub validation_timeout: Duration,

    /// Time between SIGTERM and SIGKILL when a process group is torn down.
    /// Default: 5 seconds
    pub kill_grace: Duration,

    /// Extra time added on top of a test batch's own timeout.
    /// Default: 10 seconds
    pub batch_grace: Duration,

    /// Maximum time to wait for the store's single-writer lock.
    /// Default: 30 seconds
    pub store_lock_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            type_check_timeout: Duration::from_secs(300),
            lint_timeout: Duration::from_secs(120),
            agent_timeout: Duration::from_secs(1800),
            validation_timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
            batch_grace: Duration::from_secs(10),
            store_lock_timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the type-checker timeout.
    pub fn with_type_check_timeout(mut self, timeout: Duration) -> Self {
        self.type_check_timeout = timeout;
        self
    }

    /// Sets the linter timeout.
    pub fn with_lint_timeout(mut self, timeout: Duration) -> Self {
        self.lint_timeout = timeout;
        self
    }

    /// Sets the code-generation agent timeout.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Sets the validation command timeout.
    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Sets the SIGTERM → SIGKILL grace period.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Sets the grace added to each test batch timeout.
    pub fn with_batch_grace(mut self, grace: Duration) -> Self {
        self.batch_grace = grace;
        self
    }

    /// Sets the store lock acquisition timeout.
    pub fn with_store_lock_timeout(mut self, timeout: Duration) -> Self {
        self.store_lock_timeout = timeout;
        self
    }

    /// Effective command timeout for a batch declaring `batch_secs`.
    pub fn batch_command_timeout(&self, batch_secs: u64) -> Duration {
        Duration::from_secs(batch_secs) + self.batch_grace
    }
}
