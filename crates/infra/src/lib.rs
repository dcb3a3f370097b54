//! Infrastructure layer: job queue, worker pools, result store, cache and config.
//!
//! `Orchestrator` is the entry point used by the HTTP layer; everything else is
//! exposed for wiring custom backends and for tests.

pub mod cache;
pub mod config;
pub mod jobs;
pub mod orchestrator;
pub mod store;

mod integration_tests;

pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorRuntime, QueueOverview};
