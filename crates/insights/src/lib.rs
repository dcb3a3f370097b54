//! `moodscope-insights`
//!
//! **Responsibility:** boundary to the external collaborators of the orchestrator.
//!
//! - `ListeningSource`: fetch raw listening data for a user and window.
//! - `compute_aggregate`: pure, deterministic reduction into snapshot metrics.
//! - `TextGenerator`: produce insight text from aggregate metrics.
//!
//! Nothing here persists or schedules anything. Deterministic local implementations
//! (`SyntheticListeningSource`, `TemplateGenerator`) back development and tests.

pub mod aggregate;
pub mod generator;
pub mod source;

pub use aggregate::{AggregateMetrics, FeatureStats, Mood, MoodShare, compute_aggregate};
pub use generator::{
    ContentPayload, GenerationError, GenerationRequest, TemplateGenerator, TextGenerator,
};
pub use source::{
    ArtistRecord, AudioFeatures, ListeningSource, RawListeningRecords, SourceError,
    SyntheticListeningSource,
};
