//! End-to-end tests for the epic driver.
//!
//! The library-level scenarios drive [`epic_driver::Driver`] with the
//! production agents over a scripted command runner; the CLI tests run the
//! `epic-driver` binary.

mod cli;
mod common;
mod driver_scenarios;
mod migration;
mod scheduler_scenarios;
