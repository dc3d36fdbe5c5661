//! In-process testbed simulator
//!
//! Runs every instance of a scenario as a tokio task against one in-memory
//! sync service and one in-memory swarm, then folds the instance reports
//! and metric points into a summary.

pub mod config;
pub mod runner;
pub mod stats;

pub use config::ScenarioFile;
pub use runner::ScenarioRunner;
