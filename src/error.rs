//! Top-level driver errors and their process exit codes.

use thiserror::Error;

use crate::epic::EpicParseError;
use crate::store::StoreError;

/// All stories reached DONE.
pub const EXIT_SUCCESS: i32 = 0;
/// At least one story did not reach DONE.
pub const EXIT_STORY_FAILED: i32 = 1;
/// Configuration, parse or startup error; no story was processed.
pub const EXIT_CONFIG: i32 = 2;

/// Errors that terminate a driver run.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Bad CLI input, missing epic, or missing source/test directory.
    #[error("configuration error: {0}")]
    Config(String),

    /// The epic document could not be parsed.
    #[error("epic parse error: {0}")]
    EpicParse(#[from] EpicParseError),

    /// The state store could not be opened or migrated.
    #[error("state store startup failed: {0}")]
    Startup(#[source] StoreError),

    /// A store failure after startup.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

impl DriverError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::Config(_) | DriverError::EpicParse(_) | DriverError::Startup(_) => {
                EXIT_CONFIG
            }
            DriverError::Store(_) => EXIT_STORY_FAILED,
        }
    }
}
