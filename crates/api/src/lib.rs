//! HTTP API: routing and request/response mapping over the orchestrator.

pub mod app;
