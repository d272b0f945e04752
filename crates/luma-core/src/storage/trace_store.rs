//! Trace store: aggregated traces plus their time and name indices.

use super::kv::{KeyValueStore, SkipMapStore};
use crate::broker::Record;
use crate::codec::Encoding;
use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use crate::metrics::{DECODE_FAILURES, QUERY_DURATION_SECONDS, STORE_WRITES, TRACES_EVICTED};
use crate::model::{first_span_timestamp, normalize_trace_id, Span};
use crate::query::QueryRequest;
use crate::stream::{Processor, ProcessorContext, StateHandle, Topology};
use crate::trace;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TRACES_STORE: &str = "luma-traces";
pub const TRACES_BY_TIMESTAMP_STORE: &str = "luma-traces-by-timestamp";
pub const SERVICE_NAMES_STORE: &str = "luma-service-names";
pub const SPAN_NAMES_STORE: &str = "luma-span-names";
pub const REMOTE_SERVICE_NAMES_STORE: &str = "luma-remote-service-names";
pub const AUTOCOMPLETE_TAGS_STORE: &str = "luma-autocomplete-tags";

/// Width of the backward time slices scanned by trace search.
pub const SEARCH_SLICE_MICROS: i64 = 30 * 1_000_000;

type NameSet = BTreeSet<String>;

/// The stores of one trace-topic partition.
pub struct TracePartition {
    partition: u32,
    traces: SkipMapStore<String, Vec<Span>>,
    by_timestamp: SkipMapStore<i64, NameSet>,
    service_names: SkipMapStore<String, ()>,
    span_names: SkipMapStore<String, NameSet>,
    remote_service_names: SkipMapStore<String, NameSet>,
    autocomplete_tags: SkipMapStore<String, NameSet>,
}

impl TracePartition {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            traces: SkipMapStore::new(TRACES_STORE),
            by_timestamp: SkipMapStore::new(TRACES_BY_TIMESTAMP_STORE),
            service_names: SkipMapStore::new(SERVICE_NAMES_STORE),
            span_names: SkipMapStore::new(SPAN_NAMES_STORE),
            remote_service_names: SkipMapStore::new(REMOTE_SERVICE_NAMES_STORE),
            autocomplete_tags: SkipMapStore::new(AUTOCOMPLETE_TAGS_STORE),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn num_traces(&self) -> usize {
        self.traces.approximate_num_entries()
    }

    /// Appends `spans` to the stored trace and indexes them.
    pub fn put_trace(&self, trace_id: &str, spans: Vec<Span>, index: Option<&[String]>) {
        let bucket = first_span_timestamp(&spans);

        if let Some(autocomplete_keys) = index {
            for span in &spans {
                self.index_names(span, autocomplete_keys);
            }
        }

        let stored = match self.traces.get(&trace_id.to_string()) {
            Some(existing) => trace::join(existing, spans),
            None => spans,
        };
        self.traces.put(trace_id.to_string(), stored);

        let mut ids = self.by_timestamp.get(&bucket).unwrap_or_default();
        if ids.insert(trace_id.to_string()) {
            self.by_timestamp.put(bucket, ids);
        }
        STORE_WRITES.with_label_values(&[TRACES_STORE]).inc();
    }

    fn index_names(&self, span: &Span, autocomplete_keys: &[String]) {
        let Some(service) = span.local_service_name() else { return };
        let service = service.to_string();
        if self.service_names.get(&service).is_none() {
            self.service_names.put(service.clone(), ());
        }
        if let Some(name) = span.name.as_deref() {
            add_to_set(&self.span_names, &service, name);
        }
        if let Some(remote) = span.remote_service_name() {
            add_to_set(&self.remote_service_names, &service, remote);
        }
        for key in autocomplete_keys {
            if let Some(value) = span.tags.get(key) {
                add_to_set(&self.autocomplete_tags, key, value);
            }
        }
    }

    /// Deletes every trace whose time bucket is older than
    /// `stream_time_ms - ttl_ms`, together with the bucket.
    pub fn expire(&self, stream_time_ms: i64, ttl_ms: i64) -> usize {
        let cutoff = stream_time_ms.saturating_sub(ttl_ms).saturating_mul(1000);
        let mut deleted = 0;
        for (bucket, ids) in self.by_timestamp.range(Bound::Unbounded, Bound::Excluded(cutoff)) {
            for id in ids {
                if self.traces.delete(&id).is_some() {
                    deleted += 1;
                }
            }
            self.by_timestamp.delete(&bucket);
        }
        deleted
    }

    pub fn get_trace(&self, trace_id: &str) -> Option<Vec<Span>> {
        self.traces.get(&trace_id.to_string())
    }

    fn trace_ids_between(&self, from: i64, to: i64) -> Vec<String> {
        self.by_timestamp
            .range(Bound::Included(from), Bound::Included(to))
            .into_iter()
            .rev()
            .flat_map(|(_, ids)| ids)
            .collect()
    }
}

fn add_to_set(store: &SkipMapStore<String, NameSet>, key: &str, value: &str) {
    let key = key.to_string();
    let mut values = store.get(&key).unwrap_or_default();
    if values.insert(value.to_string()) {
        store.put(key, values);
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Writes trace records into one partition and runs its retention sweep.
pub struct TraceStoreProcessor {
    store: Arc<TracePartition>,
    encoding: Encoding,
    ttl_ms: i64,
    ttl_check_interval: Duration,
    min_traces_stored: usize,
    autocomplete_keys: Option<Vec<String>>,
}

impl Processor for TraceStoreProcessor {
    fn process(&mut self, _ctx: &mut ProcessorContext, record: &Record) -> Result<()> {
        let spans = match self.encoding.decode_spans(&record.payload) {
            Ok(spans) => spans,
            Err(e) => {
                warn!(topic = %record.topic, partition = record.partition, offset = record.offset,
                    error = %e, "Skipping undecodable trace record");
                DECODE_FAILURES.with_label_values(&[record.topic.as_str()]).inc();
                return Ok(());
            }
        };
        if spans.is_empty() {
            return Ok(());
        }
        let trace_id = normalize_trace_id(&record.key);
        self.store
            .put_trace(&trace_id, spans, self.autocomplete_keys.as_deref());
        Ok(())
    }

    fn punctuation_interval(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then_some(self.ttl_check_interval)
    }

    fn punctuate(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let stored = self.store.num_traces();
        if stored <= self.min_traces_stored {
            debug!(partition = self.store.partition, stored, "Below retention threshold, skipping sweep");
            return Ok(());
        }
        let now = ctx.stream_time();
        let deleted = self.store.expire(now, self.ttl_ms);
        TRACES_EVICTED.inc_by(deleted as u64);
        info!(partition = self.store.partition, deleted, cutoff_ms = now - self.ttl_ms, "Trace retention sweep");
        Ok(())
    }
}

/// Builds the trace store topology, registering each partition's stores in `view`.
pub fn topology(config: &StorageConfig, view: &TraceStoreView) -> Topology {
    let name = "trace-store".to_string();
    if !config.trace_by_id_query_enabled && !config.trace_search_enabled {
        return Topology::Disabled { name };
    }

    let mut stores = vec![TRACES_STORE.to_string(), TRACES_BY_TIMESTAMP_STORE.to_string()];
    if config.trace_search_enabled {
        stores.extend(
            [SERVICE_NAMES_STORE, SPAN_NAMES_STORE, REMOTE_SERVICE_NAMES_STORE, AUTOCOMPLETE_TAGS_STORE]
                .map(String::from),
        );
    }

    let view = view.clone();
    let encoding = config.encoding;
    let ttl_ms = config.trace_ttl_ms as i64;
    let ttl_check_interval = config.trace_ttl_check_interval();
    let min_traces_stored = config.min_traces_stored;
    let autocomplete_keys = config
        .trace_search_enabled
        .then(|| config.autocomplete_keys.clone());

    Topology::Enabled {
        name,
        source_topic: config.trace_topic.clone(),
        sink_topics: Vec::new(),
        stores,
        factory: Box::new(move |partition| {
            let store = Arc::new(TracePartition::new(partition));
            view.register(store.clone());
            Ok(Box::new(TraceStoreProcessor {
                store,
                encoding,
                ttl_ms,
                ttl_check_interval,
                min_traces_stored,
                autocomplete_keys: autocomplete_keys.clone(),
            }) as Box<dyn Processor>)
        }),
    }
}

// ============================================================================
// Local read path
// ============================================================================

struct ViewInner {
    partitions: RwLock<BTreeMap<u32, Arc<TracePartition>>>,
    state: StateHandle,
    min_traces_stored: usize,
}

/// Read-only view over the trace partitions held by this node.
#[derive(Clone)]
pub struct TraceStoreView {
    inner: Arc<ViewInner>,
}

impl TraceStoreView {
    pub fn new(state: StateHandle, min_traces_stored: usize) -> Self {
        Self {
            inner: Arc::new(ViewInner {
                partitions: RwLock::new(BTreeMap::new()),
                state,
                min_traces_stored,
            }),
        }
    }

    fn register(&self, partition: Arc<TracePartition>) {
        self.inner.partitions.write().insert(partition.partition, partition);
    }

    fn ready_partitions(&self) -> std::result::Result<Vec<Arc<TracePartition>>, StoreError> {
        self.inner.state.ensure_queryable(TRACES_STORE)?;
        Ok(self.inner.partitions.read().values().cloned().collect())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.is_running()
    }

    pub fn approximate_num_traces(&self) -> usize {
        self.inner
            .partitions
            .read()
            .values()
            .map(|p| p.num_traces())
            .sum()
    }

    /// Spans of one trace; empty when unknown.
    pub fn get_trace(&self, trace_id: &str) -> std::result::Result<Vec<Span>, StoreError> {
        let _timer = QUERY_DURATION_SECONDS
            .with_label_values(&[TRACES_STORE, "get_trace"])
            .start_timer();
        let trace_id = normalize_trace_id(trace_id);
        let mut spans = Vec::new();
        for partition in self.ready_partitions()? {
            if let Some(found) = partition.get_trace(&trace_id) {
                spans.extend(found);
            }
        }
        Ok(spans)
    }

    /// One entry per requested ID, `None` where the trace is not held here.
    pub fn get_traces(&self, trace_ids: &[String]) -> std::result::Result<Vec<Option<Vec<Span>>>, StoreError> {
        let partitions = self.ready_partitions()?;
        Ok(trace_ids
            .iter()
            .map(|id| {
                let id = normalize_trace_id(id);
                let spans: Vec<Span> = partitions
                    .iter()
                    .filter_map(|p| p.get_trace(&id))
                    .flatten()
                    .collect();
                (!spans.is_empty()).then_some(spans)
            })
            .collect())
    }

    /// Traces matching `request`, newest first, at most `request.limit`.
    pub fn search(&self, request: &QueryRequest) -> std::result::Result<Vec<Vec<Span>>, StoreError> {
        let _timer = QUERY_DURATION_SECONDS
            .with_label_values(&[TRACES_STORE, "search"])
            .start_timer();
        let partitions = self.ready_partitions()?;
        let (from, to) = request.time_range_micros();
        let mut seen: HashSet<String> = HashSet::new();
        let mut matched: Vec<Vec<Span>> = Vec::new();

        let mut scan = |lower: i64, upper: i64, matched: &mut Vec<Vec<Span>>| {
            for partition in &partitions {
                for id in partition.trace_ids_between(lower, upper) {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    if let Some(spans) = partition.get_trace(&id) {
                        if request.test(&spans) {
                            matched.push(spans);
                        }
                    }
                }
            }
        };

        let small = partitions.iter().map(|p| p.num_traces()).sum::<usize>()
            <= self.inner.min_traces_stored;
        if small || to - SEARCH_SLICE_MICROS <= from {
            scan(from, to, &mut matched);
        } else {
            let mut upper = to;
            loop {
                let lower = (upper - SEARCH_SLICE_MICROS).max(from);
                scan(lower, upper, &mut matched);
                if lower <= from || matched.len() >= request.limit {
                    break;
                }
                upper = lower - 1;
            }
        }

        matched.sort_by(|a, b| first_span_timestamp(b).cmp(&first_span_timestamp(a)));
        matched.truncate(request.limit);
        Ok(matched)
    }

    pub fn service_names(&self) -> std::result::Result<Vec<String>, StoreError> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        for partition in self.ready_partitions()? {
            names.extend(partition.service_names.all().into_iter().map(|(k, _)| k));
        }
        Ok(names.into_iter().collect())
    }

    pub fn span_names(&self, service: &str) -> std::result::Result<Vec<String>, StoreError> {
        self.collect_set(|p| &p.span_names, service)
    }

    pub fn remote_service_names(&self, service: &str) -> std::result::Result<Vec<String>, StoreError> {
        self.collect_set(|p| &p.remote_service_names, service)
    }

    pub fn autocomplete_keys(&self) -> std::result::Result<Vec<String>, StoreError> {
        let mut keys: BTreeSet<String> = BTreeSet::new();
        for partition in self.ready_partitions()? {
            keys.extend(partition.autocomplete_tags.all().into_iter().map(|(k, _)| k));
        }
        Ok(keys.into_iter().collect())
    }

    pub fn autocomplete_values(&self, key: &str) -> std::result::Result<Vec<String>, StoreError> {
        self.collect_set(|p| &p.autocomplete_tags, key)
    }

    fn collect_set(
        &self,
        store: impl Fn(&TracePartition) -> &SkipMapStore<String, NameSet>,
        key: &str,
    ) -> std::result::Result<Vec<String>, StoreError> {
        let mut values = NameSet::new();
        for partition in self.ready_partitions()? {
            if let Some(found) = store(&partition).get(&key.to_string()) {
                values.extend(found);
            }
        }
        Ok(values.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{EngineState, PartitionRunner};
    use bytes::Bytes;

    const MINUTE_MS: i64 = 60_000;

    fn running_view(min_traces_stored: usize) -> TraceStoreView {
        let state = StateHandle::new(EngineState::Created);
        state.begin_restore(0);
        TraceStoreView::new(state, min_traces_stored)
    }

    fn span(trace_id: &str, ts_ms: i64, service: &str) -> Span {
        Span::new(trace_id, trace_id)
            .with_name("op")
            .with_timestamp(ts_ms * 1000)
            .with_local_service(service)
    }

    fn record(trace_id: &str, spans: &[Span], ts_ms: i64) -> Record {
        Record {
            topic: "zipkin-trace".into(),
            partition: 0,
            offset: 0,
            key: trace_id.into(),
            payload: Encoding::Json.encode_spans(spans).unwrap(),
            timestamp_ms: ts_ms,
        }
    }

    fn runner(config: &StorageConfig, view: &TraceStoreView) -> PartitionRunner {
        let Topology::Enabled { factory, .. } = topology(config, view) else {
            panic!("trace store should be enabled");
        };
        PartitionRunner::new(0, factory(0).unwrap())
    }

    fn put(partition: &TracePartition, trace_id: &str, ts_ms: i64) {
        partition.put_trace(trace_id, vec![span(trace_id, ts_ms, "svc")], None);
    }

    #[test]
    fn test_write_path_builds_indices() {
        let config = StorageConfig {
            autocomplete_keys: vec!["env".into()],
            ..Default::default()
        };
        let view = running_view(0);
        let mut runner = runner(&config, &view);

        let spans = vec![
            span("a", 1_000, "frontend").with_remote_service("backend").with_tag("env", "prod"),
            span("a", 1_001, "backend").with_name("query"),
        ];
        runner.handle(&record("a", &spans, 1_000)).unwrap();
        runner.handle(&record("a", &spans[..1], 1_001)).unwrap();

        assert_eq!(view.get_trace("a").unwrap().len(), 2);
        assert_eq!(view.service_names().unwrap(), vec!["backend", "frontend"]);
        assert_eq!(view.span_names("backend").unwrap(), vec!["query"]);
        assert_eq!(view.span_names("frontend").unwrap(), vec!["op"]);
        assert_eq!(view.remote_service_names("frontend").unwrap(), vec!["backend"]);
        assert_eq!(view.autocomplete_keys().unwrap(), vec!["env"]);
        assert_eq!(view.autocomplete_values("env").unwrap(), vec!["prod"]);
        assert!(view.span_names("unknown").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let config = StorageConfig::default();
        let view = running_view(0);
        let mut runner = runner(&config, &view);
        let mut bad = record("a", &[], 0);
        bad.payload = Bytes::from_static(b"{oops");
        assert!(runner.handle(&bad).unwrap().is_empty());
        runner.handle(&record("b", &[span("b", 1, "svc")], 1)).unwrap();
        assert_eq!(view.approximate_num_traces(), 1);
    }

    #[test]
    fn test_retention_sweep_honours_ttl_and_threshold() {
        let config = StorageConfig {
            trace_ttl_ms: 10 * MINUTE_MS as u64,
            trace_ttl_check_interval_ms: MINUTE_MS as u64,
            min_traces_stored: 0,
            ..Default::default()
        };
        let view = running_view(0);
        let mut runner = runner(&config, &view);

        let t = 100 * MINUTE_MS;
        runner.handle(&record("old", &[span("old", t, "svc")], t)).unwrap();
        // First tick is scheduled one interval after the first record.
        runner.handle(&record("x", &[span("x", t + 10 * MINUTE_MS, "svc")], t + 10 * MINUTE_MS)).unwrap();
        assert_eq!(view.get_trace("old").unwrap().len(), 1, "now == T + TTL keeps the trace");

        runner.handle(&record("y", &[span("y", t + 11 * MINUTE_MS, "svc")], t + 11 * MINUTE_MS)).unwrap();
        assert!(view.get_trace("old").unwrap().is_empty());
        assert_eq!(view.get_trace("x").unwrap().len(), 1);
    }

    #[test]
    fn test_retention_keeps_small_stores() {
        let config = StorageConfig {
            trace_ttl_ms: MINUTE_MS as u64,
            trace_ttl_check_interval_ms: MINUTE_MS as u64,
            min_traces_stored: 10,
            ..Default::default()
        };
        let view = running_view(10);
        let mut runner = runner(&config, &view);
        runner.handle(&record("old", &[span("old", 0, "svc")], 0)).unwrap();
        runner.handle(&record("new", &[span("new", 0, "svc")], 100 * MINUTE_MS)).unwrap();
        runner.handle(&record("newer", &[span("newer", 0, "svc")], 200 * MINUTE_MS)).unwrap();
        assert_eq!(view.get_trace("old").unwrap().len(), 1);
    }

    #[test]
    fn test_expire_tolerates_missing_traces() {
        let partition = TracePartition::new(0);
        partition.put_trace("a", vec![span("a", 1, "svc")], None);
        partition.traces.delete(&"a".to_string());
        assert_eq!(partition.expire(10_000, 0), 0);
        assert_eq!(partition.by_timestamp.approximate_num_entries(), 0);
    }

    #[test]
    fn test_search_window_boundaries() {
        let view = running_view(usize::MAX);
        let partition = Arc::new(TracePartition::new(0));
        view.register(partition.clone());

        let (end, lookback) = (1_000_000, 10_000);
        put(&partition, "before", end - lookback - 1);
        put(&partition, "start", end - lookback);
        put(&partition, "end", end);
        put(&partition, "after", end + 1);

        let found = view
            .search(&QueryRequest::new(end).lookback(lookback).limit(10))
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|t| t[0].trace_id.as_str()).collect();
        assert_eq!(ids, vec!["end", "start"]);
    }

    #[test]
    fn test_sliced_search_orders_and_limits() {
        // Enough traces to leave the single-scan path.
        let view = running_view(2);
        let partition = Arc::new(TracePartition::new(0));
        view.register(partition.clone());

        let end = 10 * MINUTE_MS;
        for (i, offset) in [0, 5_000, 40_000, 70_000, 200_000].iter().enumerate() {
            put(&partition, &format!("t{}", i), end - offset);
        }

        let found = view
            .search(&QueryRequest::new(end).lookback(5 * MINUTE_MS).limit(3))
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|t| t[0].trace_id.as_str()).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2"]);

        let all = view
            .search(&QueryRequest::new(end).lookback(5 * MINUTE_MS).limit(10))
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_not_ready_is_distinct_from_empty() {
        let view = TraceStoreView::new(StateHandle::new(EngineState::Created), 0);
        assert!(matches!(view.get_trace("a"), Err(StoreError::NotReady { .. })));
        assert!(matches!(view.service_names(), Err(StoreError::NotReady { .. })));
    }

    #[test]
    fn test_disabled_when_no_trace_queries() {
        let config = StorageConfig {
            trace_by_id_query_enabled: false,
            trace_search_enabled: false,
            ..Default::default()
        };
        let view = TraceStoreView::new(StateHandle::new(EngineState::Disabled), 0);
        assert!(!topology(&config, &view).is_enabled());
        assert!(matches!(view.get_trace("a"), Err(StoreError::Disabled { .. })));
    }
}
