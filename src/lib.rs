//! epic-driver: advances the stories of an epic through preparation,
//! implementation, quality gates, test automation and QA, keeping durable
//! per-story state so an interrupted run can resume.

pub mod agents;
pub mod classify;
pub mod config;
pub mod driver;
pub mod epic;
pub mod error;
pub mod logging;
pub mod process;
pub mod scheduler;
pub mod store;
pub mod story;
pub mod timeout;
pub mod tools;
pub mod verdict;

pub use config::DriverConfig;
pub use driver::{Driver, RunReport};
pub use error::DriverError;
