use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use moodscope_core::{TimeRange, UserId};

/// Audio features of one top track.
///
/// Every feature is optional: the upstream service omits features it could not
/// analyse, and aggregation only considers the values that are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub track_id: String,
    pub valence: Option<f64>,
    pub energy: Option<f64>,
    pub danceability: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub speechiness: Option<f64>,
    pub tempo: Option<f64>,
    pub loudness: Option<f64>,
}

/// One top artist with the genres the service attributes to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtistRecord {
    pub artist_id: String,
    pub genres: Vec<String>,
}

/// Raw listening data for a user over one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListeningRecords {
    pub tracks: Vec<AudioFeatures>,
    pub artists: Vec<ArtistRecord>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The user's authorization with the data source is no longer valid.
    #[error("authorization expired for user")]
    AuthExpired,

    #[error("rate limited by data source")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("data source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable(_))
    }
}

/// FetchListeningData.
#[async_trait]
pub trait ListeningSource: Send + Sync + 'static {
    async fn fetch_listening_data(
        &self,
        user_id: UserId,
        time_range: TimeRange,
    ) -> Result<RawListeningRecords, SourceError>;
}

const GENRES: [&str; 12] = [
    "indie pop",
    "lo-fi",
    "synthwave",
    "jazz",
    "ambient",
    "hip hop",
    "classical",
    "folk",
    "house",
    "r&b",
    "punk",
    "soul",
];

/// Deterministic stand-in for the real streaming service.
///
/// The same `(user, time_range)` always yields the same records, so repeated
/// ingestions produce identical snapshots.
#[derive(Debug, Clone)]
pub struct SyntheticListeningSource {
    tracks: usize,
    artists: usize,
}

impl SyntheticListeningSource {
    pub fn new() -> Self {
        Self {
            tracks: 50,
            artists: 20,
        }
    }

    pub fn with_sizes(tracks: usize, artists: usize) -> Self {
        Self { tracks, artists }
    }
}

impl Default for SyntheticListeningSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Small xorshift generator; enough for reproducible fake data.
struct Rng(u64);

impl Rng {
    fn seeded(user_id: UserId, time_range: TimeRange) -> Self {
        let (hi, lo) = user_id.as_uuid().as_u64_pair();
        let salt = match time_range {
            TimeRange::ShortTerm => 0x9E37_79B9_7F4A_7C15,
            TimeRange::MediumTerm => 0xC2B2_AE3D_27D4_EB4F,
            TimeRange::LongTerm => 0x1656_67B1_9E37_79F9,
        };
        let seed = hi ^ lo.rotate_left(17) ^ salt;
        Self(if seed == 0 { salt } else { seed })
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in [0, 1), rounded to 3 decimals like the upstream service.
    fn unit(&mut self) -> f64 {
        let v = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        (v * 1000.0).round() / 1000.0
    }
}

#[async_trait]
impl ListeningSource for SyntheticListeningSource {
    async fn fetch_listening_data(
        &self,
        user_id: UserId,
        time_range: TimeRange,
    ) -> Result<RawListeningRecords, SourceError> {
        let mut rng = Rng::seeded(user_id, time_range);

        let tracks = (0..self.tracks)
            .map(|i| AudioFeatures {
                track_id: format!("track-{i:03}"),
                valence: Some(rng.unit()),
                energy: Some(rng.unit()),
                danceability: Some(rng.unit()),
                acousticness: Some(rng.unit()),
                instrumentalness: Some(rng.unit()),
                speechiness: Some(rng.unit() * 0.5),
                tempo: Some(60.0 + (rng.unit() * 120.0).round()),
                loudness: Some(-30.0 + (rng.unit() * 28.0).round()),
            })
            .collect();

        let artists = (0..self.artists)
            .map(|i| {
                let count = 1 + (rng.next_u64() % 3) as usize;
                let genres = (0..count)
                    .map(|_| GENRES[(rng.next_u64() % GENRES.len() as u64) as usize].to_string())
                    .collect();
                ArtistRecord {
                    artist_id: format!("artist-{i:03}"),
                    genres,
                }
            })
            .collect();

        let records = RawListeningRecords { tracks, artists };
        debug!(
            %user_id,
            %time_range,
            tracks = records.tracks.len(),
            artists = records.artists.len(),
            "synthetic listening data generated"
        );
        Ok(records)
    }
}
