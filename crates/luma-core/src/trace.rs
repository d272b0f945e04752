//! Trace merge normalization.
//!
//! Spans reported for the same trace are coalesced so that fragments of one
//! span (the same side of the same RPC, reported in pieces) collapse into a
//! single span, while the client and server halves of a shared RPC stay
//! distinct. Arrival order of the surviving spans is preserved.

use crate::model::{normalize_trace_id, Endpoint, Span};
use std::collections::HashMap;

/// A trace under construction.
///
/// Spans are indexed by span ID, so adding a span only compares it against
/// fragments sharing its ID. Shared parents are backfilled once, when the
/// trace is finished.
#[derive(Debug, Clone, Default)]
pub struct TraceBuilder {
    spans: Vec<Span>,
    by_id: HashMap<String, Vec<usize>>,
}

impl TraceBuilder {
    pub fn from_spans(spans: impl IntoIterator<Item = Span>) -> Self {
        let mut builder = Self::default();
        builder.extend(spans);
        builder
    }

    /// Folds `span` into the first compatible fragment, or appends it.
    pub fn add(&mut self, mut span: Span) {
        span.trace_id = normalize_trace_id(&span.trace_id);
        let candidates = self.by_id.entry(span.id.clone()).or_default();
        match candidates
            .iter()
            .copied()
            .find(|&i| same_fragment(&self.spans[i], &span))
        {
            Some(i) => merge_into(&mut self.spans[i], &span),
            None => {
                candidates.push(self.spans.len());
                self.spans.push(span);
            }
        }
    }

    pub fn extend(&mut self, spans: impl IntoIterator<Item = Span>) {
        for span in spans {
            self.add(span);
        }
    }

    /// Appends the spans of `other` in their arrival order.
    pub fn join(mut self, other: TraceBuilder) -> Self {
        self.extend(other.spans);
        self
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn into_spans(mut self) -> Vec<Span> {
        backfill_shared_parents(&mut self.spans);
        self.spans
    }
}

/// Adds `span` to an already merged trace.
pub fn add_span(trace: Vec<Span>, span: Span) -> Vec<Span> {
    let mut builder = TraceBuilder::from_spans(trace);
    builder.add(span);
    builder.into_spans()
}

/// Concatenates two partial traces and re-normalizes the result.
pub fn join(left: Vec<Span>, right: Vec<Span>) -> Vec<Span> {
    TraceBuilder::from_spans(left).join(TraceBuilder::from_spans(right)).into_spans()
}

/// Canonical form of a span list. Idempotent: `merge(merge(s)) == merge(s)`.
pub fn merge(spans: Vec<Span>) -> Vec<Span> {
    TraceBuilder::from_spans(spans).into_spans()
}

fn same_fragment(a: &Span, b: &Span) -> bool {
    if a.id != b.id || a.is_shared() != b.is_shared() {
        return false;
    }
    let kinds_agree = match (a.kind, b.kind) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    };
    let services_agree = match (a.local_service_name(), b.local_service_name()) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    };
    kinds_agree && services_agree
}

fn merge_into(target: &mut Span, source: &Span) {
    if target.parent_id.is_none() {
        target.parent_id = source.parent_id.clone();
    }
    if target.kind.is_none() {
        target.kind = source.kind;
    }
    if target.name.is_none() {
        target.name = source.name.clone();
    }
    target.timestamp = match (target.timestamp, source.timestamp) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    target.duration = match (target.duration, source.duration) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    merge_endpoint(&mut target.local_endpoint, &source.local_endpoint);
    merge_endpoint(&mut target.remote_endpoint, &source.remote_endpoint);

    target.annotations.extend(source.annotations.iter().cloned());
    target.annotations.sort();
    target.annotations.dedup();

    for (key, value) in &source.tags {
        target.tags.entry(key.clone()).or_insert_with(|| value.clone());
    }
    if source.debug == Some(true) {
        target.debug = Some(true);
    }
    if source.shared == Some(true) {
        target.shared = Some(true);
    }
}

fn merge_endpoint(target: &mut Option<Endpoint>, source: &Option<Endpoint>) {
    let Some(source) = source else { return };
    match target {
        None => *target = Some(source.clone()),
        Some(existing) => {
            if existing.service_name.is_none() {
                existing.service_name = source.service_name.clone();
            }
            if existing.ipv4.is_none() {
                existing.ipv4 = source.ipv4.clone();
            }
            if existing.ipv6.is_none() {
                existing.ipv6 = source.ipv6.clone();
            }
            if existing.port.is_none() {
                existing.port = source.port;
            }
        }
    }
}

// A shared server span often omits the parent ID its client half carries.
fn backfill_shared_parents(spans: &mut [Span]) {
    let mut parents: HashMap<String, String> = HashMap::new();
    for span in spans.iter().filter(|s| !s.is_shared()) {
        if let Some(parent) = &span.parent_id {
            parents.entry(span.id.clone()).or_insert_with(|| parent.clone());
        }
    }
    for span in spans.iter_mut().filter(|s| s.is_shared() && s.parent_id.is_none()) {
        if let Some(parent) = parents.get(&span.id) {
            span.parent_id = Some(parent.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Kind;

    fn client() -> Span {
        Span::new("a", "b")
            .with_parent("a")
            .with_kind(Kind::Client)
            .with_local_service("frontend")
            .with_timestamp(10)
    }

    fn server() -> Span {
        Span::new("a", "b")
            .with_kind(Kind::Server)
            .with_shared(true)
            .with_local_service("backend")
            .with_timestamp(12)
    }

    #[test]
    fn test_adding_same_span_twice_is_idempotent() {
        let once = add_span(vec![], client());
        let twice = add_span(once.clone(), client());
        assert_eq!(once, twice);
        assert_eq!(merge(once.clone()), once);
    }

    #[test]
    fn test_shared_sides_are_kept_apart() {
        let trace = merge(vec![client(), server()]);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[1].parent_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_fragments_of_one_side_are_coalesced() {
        let start = Span::new("a", "c")
            .with_kind(Kind::Client)
            .with_local_service("frontend")
            .with_timestamp(100)
            .with_annotation(100, "cs");
        let finish = Span::new("a", "c")
            .with_duration(50)
            .with_tag("error", "timeout")
            .with_annotation(150, "cr");

        let trace = merge(vec![start, finish]);
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].timestamp, Some(100));
        assert_eq!(trace[0].duration, Some(50));
        assert_eq!(trace[0].annotations.len(), 2);
        assert!(trace[0].is_error());
    }

    #[test]
    fn test_join_preserves_arrival_order() {
        let root = Span::new("a", "a").with_local_service("frontend");
        let joined = join(vec![root.clone()], vec![client(), root.clone()]);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0], root);
        assert_eq!(joined[1].id, "b");
    }

    #[test]
    fn test_incremental_adds_match_bulk_merge() {
        let spans = vec![
            client(),
            Span::new("a", "c").with_timestamp(20),
            server(),
            Span::new("a", "c").with_duration(5).with_kind(Kind::Client),
            client().with_duration(7),
            Span::new("a", "a").with_local_service("frontend"),
        ];
        let mut builder = TraceBuilder::default();
        let mut folded = Vec::new();
        for span in spans.clone() {
            builder.add(span.clone());
            folded = add_span(folded, span);
        }
        assert_eq!(builder.into_spans(), merge(spans.clone()));
        assert_eq!(folded, merge(spans));
    }

    #[test]
    fn test_large_trace_builds_quickly() {
        let spans: Vec<Span> = (0..20_000)
            .map(|i| {
                Span::new("a", format!("{:016x}", i % 10_000))
                    .with_parent("a")
                    .with_timestamp(i)
            })
            .collect();
        let started = std::time::Instant::now();
        let trace = TraceBuilder::from_spans(spans).into_spans();
        assert_eq!(trace.len(), 10_000);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
