//! Request parameters shared by ingestion and insight generation.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Listening window requested from the data source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    /// Roughly the last 4 weeks.
    ShortTerm,
    /// Roughly the last 6 months.
    #[default]
    MediumTerm,
    /// Roughly the last year.
    LongTerm,
}

impl TimeRange {
    pub const ALL: [TimeRange; 3] = [Self::ShortTerm, Self::MediumTerm, Self::LongTerm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::MediumTerm => "medium_term",
            Self::LongTerm => "long_term",
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeRange {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown time_range '{s}'")))
    }
}

/// Kind of generated insight.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    Wellness,
    Roast,
    Productivity,
}

impl InsightCategory {
    pub const ALL: [InsightCategory; 3] = [Self::Wellness, Self::Roast, Self::Productivity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wellness => "wellness",
            Self::Roast => "roast",
            Self::Productivity => "productivity",
        }
    }

    /// Tone used when a request does not specify one.
    pub fn default_tone(&self) -> Tone {
        match self {
            Self::Wellness => Tone::Neutral,
            Self::Roast => Tone::Roast,
            Self::Productivity => Tone::Analytical,
        }
    }

    pub fn allows(&self, tone: Tone) -> bool {
        match self {
            Self::Wellness => matches!(tone, Tone::Supportive | Tone::Neutral | Tone::Encouraging),
            Self::Roast => tone == Tone::Roast,
            Self::Productivity => tone == Tone::Analytical,
        }
    }

    /// Resolve an optional tone for this category, rejecting combinations
    /// the category does not accept.
    pub fn resolve_tone(&self, tone: Option<Tone>) -> Result<Tone, DomainError> {
        let tone = tone.unwrap_or_else(|| self.default_tone());
        if self.allows(tone) {
            Ok(tone)
        } else {
            Err(DomainError::validation(format!(
                "tone '{tone}' is not valid for category '{self}'"
            )))
        }
    }
}

impl fmt::Display for InsightCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsightCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown insight category '{s}'")))
    }
}

/// Voice of a generated insight.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Supportive,
    Neutral,
    Encouraging,
    Roast,
    Analytical,
}

impl Tone {
    pub const ALL: [Tone; 5] = [
        Self::Supportive,
        Self::Neutral,
        Self::Encouraging,
        Self::Roast,
        Self::Analytical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supportive => "supportive",
            Self::Neutral => "neutral",
            Self::Encouraging => "encouraging",
            Self::Roast => "roast",
            Self::Analytical => "analytical",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tone {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown tone '{s}'")))
    }
}
