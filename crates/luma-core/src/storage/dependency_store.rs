//! Windowed dependency-link store.

use super::kv::{KeyValueStore, SkipMapStore};
use crate::broker::Record;
use crate::codec::Encoding;
use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use crate::linker::merge_links;
use crate::metrics::{DECODE_FAILURES, QUERY_DURATION_SECONDS, STORE_WRITES};
use crate::model::DependencyLink;
use crate::stream::window::WindowSpec;
use crate::stream::{Processor, ProcessorContext, StateHandle, Topology};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEPENDENCIES_STORE: &str = "luma-dependencies";

/// Links of one dependency-topic partition keyed by (window start, "parent:child").
pub struct DependencyPartition {
    partition: u32,
    links: SkipMapStore<(i64, String), DependencyLink>,
}

impl DependencyPartition {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            links: SkipMapStore::new(DEPENDENCIES_STORE),
        }
    }

    /// Adds `link` to whatever the window already holds for its key.
    pub fn put_link(&self, window_start: i64, link: DependencyLink) {
        let key = (window_start, link.key());
        let merged = match self.links.get(&key) {
            Some(mut existing) => {
                existing.call_count += link.call_count;
                existing.error_count += link.error_count;
                existing
            }
            None => link,
        };
        self.links.put(key, merged);
        STORE_WRITES.with_label_values(&[DEPENDENCIES_STORE]).inc();
    }

    /// Links of every window starting in `[from_ms, to_ms]`.
    pub fn links_between(&self, from_ms: i64, to_ms: i64) -> Vec<DependencyLink> {
        self.links
            .range(
                Bound::Included((from_ms, String::new())),
                Bound::Excluded((to_ms.saturating_add(1), String::new())),
            )
            .into_iter()
            .map(|(_, link)| link)
            .collect()
    }

    /// Drops windows starting before `before_ms`.
    pub fn expire(&self, before_ms: i64) -> usize {
        let expired = self
            .links
            .range(Bound::Unbounded, Bound::Excluded((before_ms, String::new())));
        for (key, _) in &expired {
            self.links.delete(key);
        }
        expired.len()
    }

    pub fn num_entries(&self) -> usize {
        self.links.approximate_num_entries()
    }
}

pub struct DependencyStoreProcessor {
    store: Arc<DependencyPartition>,
    encoding: Encoding,
    window: WindowSpec,
    window_size: Duration,
    ttl_ms: i64,
}

impl Processor for DependencyStoreProcessor {
    fn process(&mut self, _ctx: &mut ProcessorContext, record: &Record) -> Result<()> {
        match self.encoding.decode_link(&record.payload) {
            Ok(link) => {
                let window_start = self.window.window_start(record.timestamp_ms);
                self.store.put_link(window_start, link);
            }
            Err(e) => {
                warn!(topic = %record.topic, partition = record.partition, offset = record.offset,
                    error = %e, "Skipping undecodable dependency link");
                DECODE_FAILURES.with_label_values(&[record.topic.as_str()]).inc();
            }
        }
        Ok(())
    }

    fn punctuation_interval(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then_some(self.window_size)
    }

    fn punctuate(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let size_ms = self.window_size.as_millis() as i64;
        // A window is retained until its end falls out of the TTL.
        let before = ctx.stream_time() - self.ttl_ms - size_ms + 1;
        let dropped = self.store.expire(before);
        if dropped > 0 {
            debug!(partition = self.store.partition, dropped, "Expired dependency windows");
        }
        Ok(())
    }
}

pub fn topology(config: &StorageConfig, view: &DependencyStoreView) -> Topology {
    let name = "dependency-store".to_string();
    if !config.dependency_query_enabled {
        return Topology::Disabled { name };
    }

    let view = view.clone();
    let encoding = config.encoding;
    let window_size = config.dependency_window_size();
    let ttl_ms = config.dependency_ttl_ms as i64;

    Topology::Enabled {
        name,
        source_topic: config.dependency_topic.clone(),
        sink_topics: Vec::new(),
        stores: vec![DEPENDENCIES_STORE.to_string()],
        factory: Box::new(move |partition| {
            let store = Arc::new(DependencyPartition::new(partition));
            view.register(store.clone());
            Ok(Box::new(DependencyStoreProcessor {
                store,
                encoding,
                window: WindowSpec::Tumbling { size: window_size },
                window_size,
                ttl_ms,
            }) as Box<dyn Processor>)
        }),
    }
}

struct ViewInner {
    partitions: RwLock<BTreeMap<u32, Arc<DependencyPartition>>>,
    state: StateHandle,
}

/// Read-only view over the dependency partitions held by this node.
#[derive(Clone)]
pub struct DependencyStoreView {
    inner: Arc<ViewInner>,
}

impl DependencyStoreView {
    pub fn new(state: StateHandle) -> Self {
        Self {
            inner: Arc::new(ViewInner {
                partitions: RwLock::new(BTreeMap::new()),
                state,
            }),
        }
    }

    fn register(&self, partition: Arc<DependencyPartition>) {
        self.inner.partitions.write().insert(partition.partition, partition);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.is_running()
    }

    /// Sum of all links in windows starting within `[end_ts - lookback, end_ts]`.
    pub fn get_dependencies(&self, end_ts: i64, lookback: i64) -> std::result::Result<Vec<DependencyLink>, StoreError> {
        let _timer = QUERY_DURATION_SECONDS
            .with_label_values(&[DEPENDENCIES_STORE, "get_dependencies"])
            .start_timer();
        self.inner.state.ensure_queryable(DEPENDENCIES_STORE)?;
        let from = end_ts.saturating_sub(lookback);
        let partitions: Vec<Arc<DependencyPartition>> =
            self.inner.partitions.read().values().cloned().collect();
        Ok(merge_links(
            partitions
                .iter()
                .flat_map(|p| p.links_between(from, end_ts)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{EngineState, PartitionRunner};

    const MINUTE_MS: i64 = 60_000;

    fn running_view() -> DependencyStoreView {
        let state = StateHandle::new(EngineState::Created);
        state.begin_restore(0);
        DependencyStoreView::new(state)
    }

    fn record(link: &DependencyLink, ts_ms: i64) -> Record {
        Record {
            topic: "zipkin-dependency".into(),
            partition: 0,
            offset: 0,
            key: link.key(),
            payload: Encoding::Json.encode_link(link).unwrap(),
            timestamp_ms: ts_ms,
        }
    }

    fn runner(config: &StorageConfig, view: &DependencyStoreView) -> PartitionRunner {
        let Topology::Enabled { factory, .. } = topology(config, view) else {
            panic!("dependency store should be enabled");
        };
        PartitionRunner::new(0, factory(0).unwrap())
    }

    #[test]
    fn test_links_in_different_windows_are_summed() {
        let view = running_view();
        let mut runner = runner(&StorageConfig::default(), &view);
        runner.handle(&record(&DependencyLink::new("svc_a", "svc_b", 3, 0), 10 * MINUTE_MS)).unwrap();
        runner.handle(&record(&DependencyLink::new("svc_a", "svc_b", 2, 1), 12 * MINUTE_MS)).unwrap();

        let links = view.get_dependencies(15 * MINUTE_MS, 10 * MINUTE_MS).unwrap();
        assert_eq!(links, vec![DependencyLink::new("svc_a", "svc_b", 5, 1)]);
    }

    #[test]
    fn test_writes_in_one_window_accumulate() {
        let partition = DependencyPartition::new(0);
        partition.put_link(0, DependencyLink::new("a", "b", 1, 0));
        partition.put_link(0, DependencyLink::new("a", "b", 1, 1));
        assert_eq!(partition.num_entries(), 1);
        assert_eq!(partition.links_between(0, 0), vec![DependencyLink::new("a", "b", 2, 1)]);
    }

    #[test]
    fn test_query_window_bounds() {
        let view = running_view();
        let mut runner = runner(&StorageConfig::default(), &view);
        for minute in [1, 5, 9] {
            runner
                .handle(&record(&DependencyLink::new("a", "b", 1, 0), minute * MINUTE_MS + 30_000))
                .unwrap();
        }
        // Windows start at minutes 1, 5 and 9.
        let links = view.get_dependencies(9 * MINUTE_MS, 4 * MINUTE_MS).unwrap();
        assert_eq!(links[0].call_count, 2);
        let links = view.get_dependencies(8 * MINUTE_MS, 2 * MINUTE_MS).unwrap();
        assert!(links.is_empty());
    }

    #[test]
    fn test_expired_windows_are_purged() {
        let config = StorageConfig {
            dependency_ttl_ms: 10 * MINUTE_MS as u64,
            ..Default::default()
        };
        let view = running_view();
        let mut runner = runner(&config, &view);
        runner.handle(&record(&DependencyLink::new("a", "b", 1, 0), 0)).unwrap();
        runner.handle(&record(&DependencyLink::new("c", "d", 1, 0), 30 * MINUTE_MS)).unwrap();

        let links = view.get_dependencies(30 * MINUTE_MS, 60 * MINUTE_MS).unwrap();
        assert_eq!(links, vec![DependencyLink::new("c", "d", 1, 0)]);
    }

    #[test]
    fn test_not_ready_and_disabled() {
        let view = DependencyStoreView::new(StateHandle::new(EngineState::Restoring));
        assert!(matches!(view.get_dependencies(0, 0), Err(StoreError::NotReady { .. })));

        let config = StorageConfig {
            dependency_query_enabled: false,
            ..Default::default()
        };
        assert!(!topology(&config, &running_view()).is_enabled());
        let view = DependencyStoreView::new(StateHandle::new(EngineState::Disabled));
        assert!(matches!(view.get_dependencies(0, 0), Err(StoreError::Disabled { .. })));
    }
}
