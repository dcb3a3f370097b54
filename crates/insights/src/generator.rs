//! GenerateText: turn aggregate metrics into a written insight.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::debug;

use moodscope_core::{InsightCategory, Tone};

use crate::aggregate::{AggregateMetrics, Mood};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub metrics: AggregateMetrics,
    pub category: InsightCategory,
    pub tone: Tone,
    pub prompt_version: String,
}

/// Output of a generator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPayload {
    /// Human-readable narrative (markdown).
    pub content: String,
    /// Category-specific structured fields (scores, lists).
    pub structured: JsonValue,
    /// Identifier of the model that produced the content.
    pub model: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("rate limited by generator")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("generator unavailable: {0}")]
    Unavailable(String),

    /// The request cannot be turned into a valid prompt; retrying won't help.
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable(_))
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    /// Model identifier recorded on every insight this generator produces.
    fn model(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<ContentPayload, GenerationError>;
}

/// Deterministic, offline generator that fills fixed templates from the metrics.
#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    model: String,
}

impl TemplateGenerator {
    pub fn new() -> Self {
        Self {
            model: "moodscope-template-1".to_string(),
        }
    }

    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for TemplateGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ContentPayload, GenerationError> {
        if request.prompt_version.trim().is_empty() {
            return Err(GenerationError::InvalidPrompt(
                "prompt_version must not be empty".to_string(),
            ));
        }
        if !request.category.allows(request.tone) {
            return Err(GenerationError::InvalidPrompt(format!(
                "tone '{}' not supported for '{}'",
                request.tone, request.category
            )));
        }
        if request.metrics.source_record_count == 0 {
            return Err(GenerationError::InvalidPrompt(
                "snapshot has no listening records".to_string(),
            ));
        }

        debug!(category = %request.category, tone = %request.tone, "rendering template insight");
        let facts = Facts::from_metrics(&request.metrics);
        let (content, structured) = match request.category {
            InsightCategory::Wellness => wellness(&facts, request.tone),
            InsightCategory::Roast => roast(&facts),
            InsightCategory::Productivity => productivity(&facts),
        };

        Ok(ContentPayload {
            content,
            structured,
            model: self.model.clone(),
        })
    }
}

struct Facts {
    valence: f64,
    energy: f64,
    dominant_mood: Mood,
    top_genre: String,
    genre_count: usize,
    mood_diversity: f64,
    artist_diversity: f64,
    focused_share: f64,
    tracks: u32,
}

impl Facts {
    fn from_metrics(m: &AggregateMetrics) -> Self {
        Self {
            valence: m.avg_valence().unwrap_or(0.5),
            energy: m.avg_energy().unwrap_or(0.5),
            dominant_mood: m.dominant_mood().unwrap_or(Mood::Other),
            top_genre: m
                .top_genres()
                .first()
                .map(|(g, _)| g.to_string())
                .unwrap_or_else(|| "unclassified".to_string()),
            genre_count: m.genre_distribution.len(),
            mood_diversity: m.mood_diversity,
            artist_diversity: m.artist_diversity,
            focused_share: m
                .mood_distribution
                .get(&Mood::Focused)
                .map(|s| s.share)
                .unwrap_or(0.0),
            tracks: m.source_record_count,
        }
    }

    /// 0-10 score blending valence and energy.
    fn mood_score(&self) -> f64 {
        ((self.valence * 0.7 + self.energy * 0.3) * 100.0).round() / 10.0
    }
}

fn mood_label(mood: Mood) -> &'static str {
    match mood {
        Mood::Happy => "happy",
        Mood::Sad => "melancholic",
        Mood::Energetic => "energetic",
        Mood::Calm => "calm",
        Mood::Focused => "focused",
        Mood::Other => "eclectic",
    }
}

fn wellness(f: &Facts, tone: Tone) -> (String, JsonValue) {
    let opener = match tone {
        Tone::Supportive => "Your music has been keeping you good company.",
        Tone::Encouraging => "You are building a listening habit worth celebrating.",
        _ => "Here is a balanced look at your recent listening.",
    };
    let score = f.mood_score();
    let mut patterns = vec![
        format!("Most of your tracks read as {}.", mood_label(f.dominant_mood)),
        format!("{} leads your genre mix across {} genres.", f.top_genre, f.genre_count),
    ];
    if f.mood_diversity < 0.5 {
        patterns.push("Your genre palette is fairly narrow.".to_string());
    }
    let nudge = if f.valence < 0.4 {
        "Mix in a few brighter tracks on heavier days."
    } else if f.energy > 0.7 {
        "Balance high-energy sessions with something slower before bed."
    } else {
        "Keep exploring; your current balance looks healthy."
    };

    let mut content = format!(
        "# Wellness Insight: {} Analysis\n\n## Overall Assessment\n{opener}\n\n## Mood Score\n{score:.1}/10\n\n## Key Patterns Observed\n",
        capitalize(tone.as_str())
    );
    for (i, p) in patterns.iter().enumerate() {
        content.push_str(&format!("{}. {p}\n", i + 1));
    }
    content.push_str(&format!("\n## Wellness Nudges\n{nudge}\n"));

    let structured = json!({
        "overall_assessment": opener,
        "mood_score": score,
        "key_patterns": patterns,
        "wellness_nudges": [{ "category": "mood", "priority": "medium", "message": nudge }],
    });
    (content, structured)
}

fn roast(f: &Facts) -> (String, JsonValue) {
    let headline = format!(
        "{} tracks and you still let {} run the show.",
        f.tracks, f.top_genre
    );
    let burn = if f.artist_diversity < 0.3 {
        "Your artist rotation is shorter than a radio edit."
    } else if f.valence < 0.4 {
        "Your playlist could make a sunny day file a complaint."
    } else {
        "Aggressively average. The algorithm is bored of you."
    };
    let content = format!("# Listening Roast\n\n{headline}\n\n{burn}\n");
    let structured = json!({
        "headline": headline,
        "burns": [burn],
        "spice_level": ((1.0 - f.artist_diversity) * 10.0).round(),
    });
    (content, structured)
}

fn productivity(f: &Facts) -> (String, JsonValue) {
    let focus_pct = (f.focused_share * 100.0).round();
    let recommendation = if f.focused_share >= 0.3 {
        "Your library already has plenty of focus material; queue it for deep work blocks."
    } else {
        "Build a low-speech, mid-energy playlist for deep work."
    };
    let content = format!(
        "# Productivity Analysis\n\n{focus_pct}% of your tracks suit focused work.\nAverage energy sits at {:.2}.\n\n{recommendation}\n",
        f.energy
    );
    let structured = json!({
        "focus_track_share": f.focused_share,
        "avg_energy": f.energy,
        "recommendation": recommendation,
    });
    (content, structured)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::compute_aggregate;
    use crate::source::{ArtistRecord, AudioFeatures, RawListeningRecords};

    fn metrics() -> AggregateMetrics {
        let tracks = (0..4)
            .map(|i| AudioFeatures {
                track_id: format!("t{i}"),
                valence: Some(0.65),
                energy: Some(0.5),
                speechiness: Some(0.1),
                ..Default::default()
            })
            .collect();
        compute_aggregate(&RawListeningRecords {
            tracks,
            artists: vec![ArtistRecord {
                artist_id: "a".into(),
                genres: vec!["lo-fi".into()],
            }],
        })
    }

    fn request(category: InsightCategory, tone: Tone) -> GenerationRequest {
        GenerationRequest {
            metrics: metrics(),
            category,
            tone,
            prompt_version: "v1.0".into(),
        }
    }

    #[tokio::test]
    async fn wellness_output_is_deterministic_and_structured() {
        let g = TemplateGenerator::new();
        let req = request(InsightCategory::Wellness, Tone::Supportive);

        let a = g.generate(&req).await.unwrap();
        let b = g.generate(&req).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.model, "moodscope-template-1");
        assert!(a.content.starts_with("# Wellness Insight: Supportive Analysis"));
        let score = a.structured["mood_score"].as_f64().unwrap();
        assert!((6.0..=6.1).contains(&score), "score {score}");
        assert!(a.structured["key_patterns"][0]
            .as_str()
            .unwrap()
            .contains("focused"));
    }

    #[tokio::test]
    async fn productivity_reports_focus_share() {
        let g = TemplateGenerator::new();
        let out = g
            .generate(&request(InsightCategory::Productivity, Tone::Analytical))
            .await
            .unwrap();
        assert_eq!(out.structured["focus_track_share"], 1.0);
    }

    #[tokio::test]
    async fn mismatched_tone_is_an_invalid_prompt() {
        let g = TemplateGenerator::new();
        let err = g
            .generate(&request(InsightCategory::Roast, Tone::Neutral))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::InvalidPrompt(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn empty_snapshot_cannot_be_described() {
        let g = TemplateGenerator::new();
        let mut req = request(InsightCategory::Wellness, Tone::Neutral);
        req.metrics = AggregateMetrics::default();
        assert!(matches!(
            g.generate(&req).await,
            Err(GenerationError::InvalidPrompt(_))
        ));
    }
}
