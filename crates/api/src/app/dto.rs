use std::str::FromStr;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use moodscope_core::{InsightCategory, TimeRange};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitJobRequest {
    pub category: String,
    #[serde(default)]
    pub payload: JsonValue,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotListQuery {
    pub limit: Option<String>,
    pub time_range: Option<String>,
}

pub struct SnapshotFilter {
    pub limit: Option<usize>,
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InsightListQuery {
    pub limit: Option<String>,
    pub category: Option<String>,
}

pub struct InsightFilter {
    pub limit: Option<usize>,
    pub category: Option<InsightCategory>,
}

// -------------------------
// Parsing helpers
// -------------------------

/// Unwrap a JSON body, turning malformed input into a 400 with our error shape.
pub fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, axum::response::Response> {
    body.map(|Json(value)| value)
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()))
}

/// Parse an id or other path segment via its `FromStr`.
pub fn parse_path<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: FromStr<Err = moodscope_core::DomainError>,
{
    raw.parse().map_err(errors::domain_error_to_response)
}

/// Blank query values count as absent.
fn parse_limit(raw: Option<&str>) -> Result<Option<usize>, axum::response::Response> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse::<usize>().map(Some).map_err(|_| {
            errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("limit must be a positive integer, got '{raw}'"),
            )
        }),
    }
}

fn parse_optional<T>(raw: Option<&str>) -> Result<Option<T>, axum::response::Response>
where
    T: FromStr<Err = moodscope_core::DomainError>,
{
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_path::<T>(raw).map(Some),
    }
}

impl SnapshotListQuery {
    pub fn parse(self) -> Result<SnapshotFilter, axum::response::Response> {
        Ok(SnapshotFilter {
            limit: parse_limit(self.limit.as_deref())?,
            time_range: parse_optional(self.time_range.as_deref())?,
        })
    }
}

impl InsightListQuery {
    pub fn parse(self) -> Result<InsightFilter, axum::response::Response> {
        Ok(InsightFilter {
            limit: parse_limit(self.limit.as_deref())?,
            category: parse_optional(self.category.as_deref())?,
        })
    }
}
