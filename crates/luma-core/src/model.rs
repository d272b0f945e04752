//! Zipkin v2 data model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    Client,
    Server,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service_name: Some(name.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Annotation {
    pub timestamp: i64,
    pub value: String,
}

/// One timed operation. Timestamps and durations are in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub trace_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub id: String,
    #[serde(default)]
    pub kind: Option<Kind>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub local_endpoint: Option<Endpoint>,
    #[serde(default)]
    pub remote_endpoint: Option<Endpoint>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub shared: Option<bool>,
}

impl Span {
    pub fn new(trace_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            trace_id: normalize_trace_id(&trace_id.into()),
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn local_service_name(&self) -> Option<&str> {
        self.local_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
    }

    pub fn remote_service_name(&self) -> Option<&str> {
        self.remote_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
    }

    pub fn is_shared(&self) -> bool {
        self.shared.unwrap_or(false)
    }

    pub fn is_error(&self) -> bool {
        self.tags.contains_key("error")
    }

    // Builder-style helpers, mostly used by tests and the ingestion path.

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_timestamp(mut self, micros: i64) -> Self {
        self.timestamp = Some(micros);
        self
    }

    pub fn with_duration(mut self, micros: i64) -> Self {
        self.duration = Some(micros);
        self
    }

    pub fn with_local_service(mut self, service: impl Into<String>) -> Self {
        self.local_endpoint = Some(Endpoint::service(service));
        self
    }

    pub fn with_remote_service(mut self, service: impl Into<String>) -> Self {
        self.remote_endpoint = Some(Endpoint::service(service));
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, timestamp: i64, value: impl Into<String>) -> Self {
        self.annotations.push(Annotation {
            timestamp,
            value: value.into(),
        });
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = Some(shared);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

impl DependencyLink {
    pub fn new(parent: impl Into<String>, child: impl Into<String>, call_count: u64, error_count: u64) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
            call_count,
            error_count,
        }
    }

    /// Key used on the dependency topic and in the dependency store.
    pub fn key(&self) -> String {
        format!("{}:{}", self.parent, self.child)
    }
}

/// Lower-cases a trace ID and drops an all-zero high 64 bits. IDs that are
/// not 128-bit hex are only lower-cased.
pub fn normalize_trace_id(trace_id: &str) -> String {
    let lower = trace_id.trim().to_ascii_lowercase();
    if lower.len() == 32
        && lower.bytes().all(|b| b.is_ascii_hexdigit())
        && lower.starts_with("0000000000000000")
    {
        lower[16..].to_string()
    } else {
        lower
    }
}

/// Timestamp of the first span of a trace, used as its time-index bucket.
pub fn first_span_timestamp(spans: &[Span]) -> i64 {
    spans.first().and_then(|s| s.timestamp).unwrap_or(0)
}
