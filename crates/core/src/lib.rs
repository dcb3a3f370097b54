//! `moodscope-core`: domain primitives shared by every other crate.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod params;

pub use error::{DomainError, DomainResult};
pub use id::{InsightId, SnapshotId, UserId};
pub use params::{InsightCategory, TimeRange, Tone};
