//! ComputeAggregate: pure reduction of raw listening records into snapshot metrics.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::source::{AudioFeatures, RawListeningRecords};

/// Genres kept in the distribution.
const TOP_GENRES: usize = 10;
/// Artist count at which artist diversity saturates.
const ARTIST_DIVERSITY_SATURATION: f64 = 50.0;
/// log2(10): entropy of a uniform top-10 genre distribution.
const MAX_GENRE_ENTROPY: f64 = 3.32;
/// Value assumed for a missing feature when classifying moods.
const NEUTRAL_FEATURE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub avg: f64,
    /// Sample standard deviation; 0 for a single value.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Happy,
    Sad,
    Energetic,
    Calm,
    Focused,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoodShare {
    /// Fraction of tracks in this mood, 3 decimals.
    pub share: f64,
    pub track_count: u32,
}

/// Numeric and categorical summary stored on a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// Keyed by feature name (`valence`, `energy`, ...).
    pub feature_stats: BTreeMap<String, FeatureStats>,
    pub genre_distribution: BTreeMap<String, f64>,
    pub mood_distribution: BTreeMap<Mood, MoodShare>,
    pub artist_diversity: f64,
    pub mood_diversity: f64,
    pub source_record_count: u32,
}

impl AggregateMetrics {
    pub fn avg(&self, feature: &str) -> Option<f64> {
        self.feature_stats.get(feature).map(|s| s.avg)
    }

    pub fn avg_valence(&self) -> Option<f64> {
        self.avg("valence")
    }

    pub fn avg_energy(&self) -> Option<f64> {
        self.avg("energy")
    }

    /// Mood with the largest share (ties go to the first mood in declaration order).
    pub fn dominant_mood(&self) -> Option<Mood> {
        self.mood_distribution
            .iter()
            .fold(None, |best: Option<(Mood, f64)>, (mood, s)| match best {
                Some((_, share)) if share >= s.share => best,
                _ => Some((*mood, s.share)),
            })
            .map(|(m, _)| m)
    }

    /// Genres ordered by share, largest first.
    pub fn top_genres(&self) -> Vec<(&str, f64)> {
        let mut genres: Vec<(&str, f64)> = self
            .genre_distribution
            .iter()
            .map(|(g, s)| (g.as_str(), *s))
            .collect();
        genres.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        genres
    }
}

type FeatureGetter = fn(&AudioFeatures) -> Option<f64>;

const FEATURES: [(&str, FeatureGetter); 8] = [
    ("valence", |t| t.valence),
    ("energy", |t| t.energy),
    ("danceability", |t| t.danceability),
    ("acousticness", |t| t.acousticness),
    ("instrumentalness", |t| t.instrumentalness),
    ("speechiness", |t| t.speechiness),
    ("tempo", |t| t.tempo),
    ("loudness", |t| t.loudness),
];

/// Deterministic: identical input always produces identical output.
pub fn compute_aggregate(records: &RawListeningRecords) -> AggregateMetrics {
    let genre_distribution = genre_distribution(records);
    AggregateMetrics {
        feature_stats: feature_stats(&records.tracks),
        mood_distribution: mood_distribution(&records.tracks),
        artist_diversity: round3(
            (records.artists.len() as f64 / ARTIST_DIVERSITY_SATURATION).min(1.0),
        ),
        mood_diversity: round3((entropy(&genre_distribution) / MAX_GENRE_ENTROPY).min(1.0)),
        genre_distribution,
        source_record_count: records.tracks.len() as u32,
    }
}

fn feature_stats(tracks: &[AudioFeatures]) -> BTreeMap<String, FeatureStats> {
    let mut out = BTreeMap::new();
    for (name, get) in FEATURES {
        let values: Vec<f64> = tracks
            .iter()
            .filter_map(get)
            .filter(|v| v.is_finite())
            .collect();
        if values.is_empty() {
            continue;
        }
        let avg = mean(&values);
        out.insert(
            name.to_string(),
            FeatureStats {
                avg,
                std: stddev_sample(&values, avg),
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            },
        );
    }
    out
}

fn genre_distribution(records: &RawListeningRecords) -> BTreeMap<String, f64> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    let mut total = 0u32;
    for genre in records.artists.iter().flat_map(|a| a.genres.iter()) {
        *counts.entry(genre.as_str()).or_default() += 1;
        total += 1;
    }
    if total == 0 {
        return BTreeMap::new();
    }

    let mut ranked: Vec<(&str, u32)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(TOP_GENRES)
        .map(|(g, c)| (g.to_string(), round3(c as f64 / total as f64)))
        .collect()
}

/// A track can land in several moods; `Other` only when it lands in none.
fn classify(t: &AudioFeatures) -> Vec<Mood> {
    let valence = t.valence.unwrap_or(NEUTRAL_FEATURE);
    let energy = t.energy.unwrap_or(NEUTRAL_FEATURE);
    let danceability = t.danceability.unwrap_or(NEUTRAL_FEATURE);
    let acousticness = t.acousticness.unwrap_or(NEUTRAL_FEATURE);
    let speechiness = t.speechiness.unwrap_or(NEUTRAL_FEATURE);

    let mut moods = Vec::with_capacity(3);
    if valence > 0.6 && energy > 0.6 {
        moods.push(Mood::Happy);
    } else if valence < 0.4 && energy < 0.5 {
        moods.push(Mood::Sad);
    }
    if energy > 0.7 && danceability > 0.6 {
        moods.push(Mood::Energetic);
    } else if energy < 0.4 && acousticness > 0.5 {
        moods.push(Mood::Calm);
    }
    if speechiness < 0.3 && (0.3..=0.7).contains(&energy) {
        moods.push(Mood::Focused);
    }
    if moods.is_empty() {
        moods.push(Mood::Other);
    }
    moods
}

fn mood_distribution(tracks: &[AudioFeatures]) -> BTreeMap<Mood, MoodShare> {
    if tracks.is_empty() {
        return BTreeMap::new();
    }
    let mut counts: BTreeMap<Mood, u32> = BTreeMap::new();
    for mood in tracks.iter().flat_map(classify) {
        *counts.entry(mood).or_default() += 1;
    }
    let total = tracks.len() as f64;
    counts
        .into_iter()
        .map(|(mood, track_count)| {
            (
                mood,
                MoodShare {
                    share: round3(track_count as f64 / total),
                    track_count,
                },
            )
        })
        .collect()
}

fn entropy(distribution: &BTreeMap<String, f64>) -> f64 {
    distribution
        .values()
        .filter(|p| **p > 0.0)
        .map(|p| -p * p.log2())
        .sum()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / (xs.len() as f64)
}

/// Sample standard deviation (n-1).
fn stddev_sample(xs: &[f64], mean: f64) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let var = xs
        .iter()
        .map(|x| {
            let d = x - mean;
            d * d
        })
        .sum::<f64>()
        / ((xs.len() - 1) as f64);
    var.sqrt()
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ArtistRecord;
    use proptest::prelude::*;

    fn track(valence: f64, energy: f64, danceability: f64, acousticness: f64, speechiness: f64) -> AudioFeatures {
        AudioFeatures {
            track_id: "t".into(),
            valence: Some(valence),
            energy: Some(energy),
            danceability: Some(danceability),
            acousticness: Some(acousticness),
            speechiness: Some(speechiness),
            ..Default::default()
        }
    }

    fn artist(genres: &[&str]) -> ArtistRecord {
        ArtistRecord {
            artist_id: "a".into(),
            genres: genres.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn empty_input_yields_empty_metrics() {
        let m = compute_aggregate(&RawListeningRecords::default());
        assert!(m.feature_stats.is_empty());
        assert!(m.mood_distribution.is_empty());
        assert!(m.genre_distribution.is_empty());
        assert_eq!(m.source_record_count, 0);
        assert_eq!(m.mood_diversity, 0.0);
        assert_eq!(m.dominant_mood(), None);
    }

    #[test]
    fn feature_stats_use_sample_stddev_and_skip_missing_values() {
        let mut a = track(0.5, 0.5, 0.5, 0.5, 0.5);
        a.tempo = Some(100.0);
        let mut b = track(0.8, 0.5, 0.5, 0.5, 0.5);
        b.tempo = None;
        let records = RawListeningRecords {
            tracks: vec![a, b],
            artists: vec![],
        };

        let m = compute_aggregate(&records);
        let valence = m.feature_stats["valence"];
        assert!((valence.avg - 0.65).abs() < 1e-9);
        assert!((valence.std - 0.212_132).abs() < 1e-6);
        assert_eq!(valence.min, 0.5);
        assert_eq!(valence.max, 0.8);

        let tempo = m.feature_stats["tempo"];
        assert_eq!(tempo.avg, 100.0);
        assert_eq!(tempo.std, 0.0);
        assert!(!m.feature_stats.contains_key("loudness"));
    }

    #[test]
    fn moods_can_overlap_and_other_is_exclusive() {
        let records = RawListeningRecords {
            tracks: vec![
                // happy + energetic
                track(0.9, 0.8, 0.8, 0.1, 0.5),
                // sad + calm
                track(0.2, 0.3, 0.2, 0.9, 0.5),
                // focused only
                track(0.5, 0.5, 0.5, 0.5, 0.1),
                // nothing matches
                track(0.5, 0.9, 0.1, 0.1, 0.5),
            ],
            artists: vec![],
        };

        let m = compute_aggregate(&records);
        let d = &m.mood_distribution;
        assert_eq!(d[&Mood::Happy].track_count, 1);
        assert_eq!(d[&Mood::Energetic].track_count, 1);
        assert_eq!(d[&Mood::Sad].track_count, 1);
        assert_eq!(d[&Mood::Calm].track_count, 1);
        assert_eq!(d[&Mood::Focused].track_count, 1);
        assert_eq!(d[&Mood::Other].track_count, 1);
        assert_eq!(d[&Mood::Other].share, 0.25);
    }

    #[test]
    fn missing_features_classify_as_neutral() {
        let records = RawListeningRecords {
            tracks: vec![AudioFeatures::default()],
            artists: vec![],
        };
        let m = compute_aggregate(&records);
        assert_eq!(m.mood_distribution.len(), 1);
        assert_eq!(m.mood_distribution[&Mood::Other].track_count, 1);
    }

    #[test]
    fn genre_distribution_keeps_top_ten_with_name_tiebreak() {
        let names: Vec<String> = (0..12).map(|i| format!("g{i:02}")).collect();
        let mut artists: Vec<ArtistRecord> = names.iter().map(|g| artist(&[g.as_str()])).collect();
        artists.push(artist(&["g11", "g11"]));

        let m = compute_aggregate(&RawListeningRecords {
            tracks: vec![],
            artists,
        });

        assert_eq!(m.genre_distribution.len(), 10);
        assert_eq!(m.genre_distribution["g11"], round3(3.0 / 14.0));
        assert!(m.genre_distribution.contains_key("g00"));
        assert!(m.genre_distribution.contains_key("g08"));
        assert!(!m.genre_distribution.contains_key("g09"));
        assert!(!m.genre_distribution.contains_key("g10"));
        assert_eq!(m.top_genres()[0].0, "g11");
    }

    #[test]
    fn diversity_scores_saturate_at_one() {
        let artists: Vec<ArtistRecord> = (0..60).map(|i| artist(&[format!("g{}", i % 10).as_str()]))
            .collect();
        let m = compute_aggregate(&RawListeningRecords {
            tracks: vec![],
            artists,
        });
        assert_eq!(m.artist_diversity, 1.0);
        assert_eq!(m.mood_diversity, 1.0);

        let single = compute_aggregate(&RawListeningRecords {
            tracks: vec![],
            artists: vec![artist(&["jazz"])],
        });
        assert_eq!(single.artist_diversity, 0.02);
        assert_eq!(single.mood_diversity, 0.0);
    }

    fn arb_track() -> impl Strategy<Value = AudioFeatures> {
        (
            proptest::option::of(0.0f64..=1.0),
            proptest::option::of(0.0f64..=1.0),
            proptest::option::of(0.0f64..=1.0),
            proptest::option::of(0.0f64..=1.0),
            proptest::option::of(0.0f64..=1.0),
            proptest::option::of(40.0f64..=220.0),
        )
            .prop_map(|(v, e, d, a, s, tempo)| AudioFeatures {
                track_id: "p".into(),
                valence: v,
                energy: e,
                danceability: d,
                acousticness: a,
                speechiness: s,
                tempo,
                ..Default::default()
            })
    }

    fn arb_artist() -> impl Strategy<Value = ArtistRecord> {
        proptest::collection::vec("[a-e]{1,3}", 0..4).prop_map(|genres| ArtistRecord {
            artist_id: "p".into(),
            genres,
        })
    }

    proptest! {
        #[test]
        fn aggregate_is_deterministic_and_bounded(
            tracks in proptest::collection::vec(arb_track(), 0..40),
            artists in proptest::collection::vec(arb_artist(), 0..70),
        ) {
            let records = RawListeningRecords { tracks, artists };
            let a = compute_aggregate(&records);
            let b = compute_aggregate(&records);
            prop_assert_eq!(&a, &b);

            prop_assert!((0.0..=1.0).contains(&a.artist_diversity));
            prop_assert!((0.0..=1.0).contains(&a.mood_diversity));
            prop_assert!(a.genre_distribution.len() <= TOP_GENRES);
            prop_assert_eq!(a.source_record_count as usize, records.tracks.len());

            for stats in a.feature_stats.values() {
                prop_assert!(stats.min <= stats.avg + 1e-9);
                prop_assert!(stats.avg <= stats.max + 1e-9);
                prop_assert!(stats.std >= 0.0);
            }

            // every track is counted at least once
            let counted: u32 = a.mood_distribution.values().map(|s| s.track_count).sum();
            prop_assert!(counted as usize >= records.tracks.len());
        }
    }
}
