use crate::model::Span;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_LOOKBACK_MS: i64 = 86_400_000;
pub const DEFAULT_LIMIT: usize = 10;

/// Trace search criteria. `end_ts` and `lookback` are milliseconds; durations
/// are microseconds like span durations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub service_name: Option<String>,
    pub remote_service_name: Option<String>,
    pub span_name: Option<String>,
    /// Tag key to required value; an empty value only requires the key
    /// (or an annotation with that value) to be present.
    pub annotation_query: BTreeMap<String, String>,
    pub min_duration: Option<i64>,
    pub max_duration: Option<i64>,
    pub end_ts: i64,
    pub lookback: i64,
    pub limit: usize,
}

impl QueryRequest {
    pub fn new(end_ts: i64) -> Self {
        Self {
            service_name: None,
            remote_service_name: None,
            span_name: None,
            annotation_query: BTreeMap::new(),
            min_duration: None,
            max_duration: None,
            end_ts,
            lookback: DEFAULT_LOOKBACK_MS,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn service_name(mut self, service: impl Into<String>) -> Self {
        self.service_name = Some(service.into());
        self
    }

    pub fn remote_service_name(mut self, service: impl Into<String>) -> Self {
        self.remote_service_name = Some(service.into());
        self
    }

    pub fn span_name(mut self, name: impl Into<String>) -> Self {
        self.span_name = Some(name.into());
        self
    }

    pub fn annotation_query(mut self, query: &str) -> Self {
        self.annotation_query = parse_annotation_query(query);
        self
    }

    pub fn duration(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min_duration = min;
        self.max_duration = max;
        self
    }

    pub fn lookback(mut self, lookback_ms: i64) -> Self {
        self.lookback = lookback_ms;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Inclusive `[from, to]` bounds of the query window in microseconds.
    pub fn time_range_micros(&self) -> (i64, i64) {
        let to = self.end_ts.saturating_mul(1000);
        let from = self.end_ts.saturating_sub(self.lookback).max(0).saturating_mul(1000);
        (from, to)
    }

    /// Whether a trace satisfies every criterion. Each criterion may be met
    /// by a different span, but only spans of `service_name` count when it
    /// is set.
    pub fn test(&self, spans: &[Span]) -> bool {
        let mut service_found = self.service_name.is_none();
        let mut remote_found = self.remote_service_name.is_none();
        let mut name_found = self.span_name.is_none();
        let mut duration_found = self.min_duration.is_none() && self.max_duration.is_none();
        let mut remaining = self.annotation_query.clone();

        for span in spans {
            if let Some(service) = &self.service_name {
                if span.local_service_name() != Some(service.as_str()) {
                    continue;
                }
                service_found = true;
            }
            if let Some(remote) = &self.remote_service_name {
                if span.remote_service_name() == Some(remote.as_str()) {
                    remote_found = true;
                }
            }
            if let Some(name) = &self.span_name {
                if span.name.as_deref() == Some(name.as_str()) {
                    name_found = true;
                }
            }
            if !duration_found {
                if let Some(duration) = span.duration {
                    let above = self.min_duration.map_or(true, |min| duration >= min);
                    let below = self.max_duration.map_or(true, |max| duration <= max);
                    duration_found = above && below;
                }
            }
            if !remaining.is_empty() {
                for annotation in &span.annotations {
                    if remaining.get(&annotation.value).is_some_and(|v| v.is_empty()) {
                        remaining.remove(&annotation.value);
                    }
                }
                for (key, value) in &span.tags {
                    if remaining.get(key).is_some_and(|want| want.is_empty() || want == value) {
                        remaining.remove(key);
                    }
                }
            }
        }
        service_found && remote_found && name_found && duration_found && remaining.is_empty()
    }
}

/// Parses `error and http.method=GET` into `{error: "", http.method: "GET"}`.
pub fn parse_annotation_query(query: &str) -> BTreeMap<String, String> {
    query
        .split(" and ")
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| match term.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (term.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Kind;

    fn trace() -> Vec<Span> {
        vec![
            Span::new("a", "a")
                .with_name("get /")
                .with_kind(Kind::Server)
                .with_local_service("frontend")
                .with_duration(500)
                .with_tag("http.method", "GET"),
            Span::new("a", "b")
                .with_parent("a")
                .with_name("query")
                .with_kind(Kind::Client)
                .with_local_service("backend")
                .with_remote_service("db")
                .with_duration(100)
                .with_tag("error", "")
                .with_annotation(10, "retry"),
        ]
    }

    #[test]
    fn test_parse_annotation_query() {
        let parsed = parse_annotation_query("error and http.method=GET and  retry ");
        assert_eq!(parsed.get("error").map(String::as_str), Some(""));
        assert_eq!(parsed.get("http.method").map(String::as_str), Some("GET"));
        assert!(parsed.contains_key("retry"));
    }

    #[test]
    fn test_service_scoped_criteria() {
        let request = QueryRequest::new(0).service_name("backend");
        assert!(request.clone().remote_service_name("db").test(&trace()));
        assert!(!request.clone().span_name("get /").test(&trace()));
        assert!(request.clone().annotation_query("error and retry").test(&trace()));
        assert!(!request.annotation_query("http.method=GET").test(&trace()));
    }

    #[test]
    fn test_duration_bounds() {
        let request = QueryRequest::new(0);
        assert!(request.clone().duration(Some(400), None).test(&trace()));
        assert!(!request.clone().duration(Some(150), Some(400)).test(&trace()));
        assert!(request.duration(Some(50), Some(150)).test(&trace()));
    }

    #[test]
    fn test_time_range_micros() {
        let request = QueryRequest::new(10_000).lookback(4_000);
        assert_eq!(request.time_range_micros(), (6_000_000, 10_000_000));
        let request = QueryRequest::new(1_000).lookback(5_000);
        assert_eq!(request.time_range_micros().0, 0);
    }

    #[test]
    fn test_unknown_service_matches_nothing() {
        assert!(!QueryRequest::new(0).service_name("nope").test(&trace()));
        assert!(QueryRequest::new(0).test(&trace()));
    }
}
