//! Response envelopes and time-format negotiation.
//!
//! List results share one envelope shape. Timestamps serialize as integer
//! Unix nanoseconds on the v2 surface; legacy callers request RFC 3339
//! strings via the `x-lumen-time-format` header, applied as a uniform
//! rewrite of `*_unix_nanos` fields so every endpoint behaves identically.

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat};
use serde::Serialize;

/// Header selecting the legacy time representation.
pub const TIME_FORMAT_HEADER: &str = "x-lumen-time-format";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeFormat {
    /// Integer Unix nanoseconds (v2 surface).
    #[default]
    Nanos,
    /// RFC 3339 strings (legacy surface).
    Rfc3339,
}

impl TimeFormat {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match headers
            .get(TIME_FORMAT_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(v) if v.eq_ignore_ascii_case("rfc3339") => Self::Rfc3339,
            _ => Self::Nanos,
        }
    }
}

/// The uniform list envelope.
#[derive(Debug, Serialize)]
pub struct ListEnvelope<T> {
    pub items: Vec<T>,
    pub count: usize,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> ListEnvelope<T> {
    pub fn new(items: Vec<T>, limit: i64, offset: i64, has_more: bool) -> Self {
        Self {
            count: items.len(),
            items,
            limit,
            offset,
            has_more,
            next_cursor: None,
        }
    }

    #[must_use]
    pub fn with_cursor(mut self, next_cursor: Option<String>) -> Self {
        self.next_cursor = next_cursor;
        self
    }
}

/// Serialize a response body in the requested time format.
pub fn render<T: Serialize>(format: TimeFormat, body: &T) -> Response {
    match format {
        TimeFormat::Nanos => Json(body).into_response(),
        TimeFormat::Rfc3339 => match serde_json::to_value(body) {
            Ok(mut value) => {
                rewrite_times(&mut value);
                Json(value).into_response()
            }
            Err(e) => crate::error::Error::fatal(format!("response serialization failed: {e}"))
                .into_response(),
        },
    }
}

/// Recursively replace integer `*_unix_nanos` fields with RFC 3339 strings.
fn rewrite_times(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if key.ends_with("_unix_nanos") {
                    if let Some(nanos) = v.as_i64() {
                        *v = serde_json::Value::String(
                            DateTime::from_timestamp_nanos(nanos)
                                .to_rfc3339_opts(SecondsFormat::Nanos, true),
                        );
                        continue;
                    }
                }
                rewrite_times(v);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                rewrite_times(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_selects_legacy_format() {
        let mut headers = HeaderMap::new();
        assert_eq!(TimeFormat::from_headers(&headers), TimeFormat::Nanos);
        headers.insert(TIME_FORMAT_HEADER, "rfc3339".parse().unwrap());
        assert_eq!(TimeFormat::from_headers(&headers), TimeFormat::Rfc3339);
        headers.insert(TIME_FORMAT_HEADER, "RFC3339".parse().unwrap());
        assert_eq!(TimeFormat::from_headers(&headers), TimeFormat::Rfc3339);
    }

    #[test]
    fn rewrite_converts_nested_nanos_fields() {
        let mut value = serde_json::json!({
            "start_unix_nanos": 1_700_000_000_000_000_000i64,
            "items": [{ "db_time_unix_nanos": 0i64, "name": "unchanged" }],
            "count": 3,
        });
        rewrite_times(&mut value);
        assert_eq!(
            value["start_unix_nanos"],
            serde_json::json!("2023-11-14T22:13:20.000000000Z")
        );
        assert_eq!(
            value["items"][0]["db_time_unix_nanos"],
            serde_json::json!("1970-01-01T00:00:00.000000000Z")
        );
        assert_eq!(value["items"][0]["name"], serde_json::json!("unchanged"));
        assert_eq!(value["count"], serde_json::json!(3));
    }

    #[test]
    fn envelope_counts_items() {
        let env = ListEnvelope::new(vec![1, 2, 3], 100, 0, false);
        assert_eq!(env.count, 3);
        assert!(env.next_cursor.is_none());
        let env = env.with_cursor(Some("abc".into()));
        assert_eq!(env.next_cursor.as_deref(), Some("abc"));
    }
}
