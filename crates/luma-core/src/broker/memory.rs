use super::remote::FetchResponse;
use super::{
    partition_for, Broker, BrokerAdmin, ClusterDescription, PartitionConsumer, Producer, Record,
    RecordMetadata, TopicSpec,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

lazy_static::lazy_static! {
    static ref CLUSTERS: DashMap<String, Arc<ClusterState>> = DashMap::new();
}

#[derive(Default)]
struct Segment {
    base_offset: u64,
    records: VecDeque<Record>,
    newest_ms: i64,
}

/// Append-only log for one partition. Offsets stay stable when old records
/// are discarded by retention.
#[derive(Default)]
struct PartitionLog {
    retention_ms: Option<u64>,
    segment: RwLock<Segment>,
    appended: Notify,
}

impl PartitionLog {
    fn new(retention_ms: Option<u64>) -> Self {
        Self {
            retention_ms,
            ..Default::default()
        }
    }

    fn append(&self, mut record: Record) -> RecordMetadata {
        let metadata = {
            let mut segment = self.segment.write();
            record.offset = segment.base_offset + segment.records.len() as u64;
            let metadata = RecordMetadata {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                timestamp_ms: record.timestamp_ms,
            };
            segment.newest_ms = segment.newest_ms.max(record.timestamp_ms);
            segment.records.push_back(record);
            if let Some(retention_ms) = self.retention_ms {
                let cutoff = segment.newest_ms.saturating_sub(retention_ms as i64);
                while segment.records.front().is_some_and(|r| r.timestamp_ms < cutoff) {
                    segment.records.pop_front();
                    segment.base_offset += 1;
                }
            }
            metadata
        };
        self.appended.notify_waiters();
        metadata
    }

    /// Reads from `offset`, or from the oldest retained record if that is later.
    fn read(&self, offset: u64, max_records: usize) -> Vec<Record> {
        let segment = self.segment.read();
        let skip = offset.saturating_sub(segment.base_offset) as usize;
        segment
            .records
            .iter()
            .skip(skip)
            .take(max_records)
            .cloned()
            .collect()
    }

    fn start_offset(&self) -> u64 {
        self.segment.read().base_offset
    }

    fn end_offset(&self) -> u64 {
        let segment = self.segment.read();
        segment.base_offset + segment.records.len() as u64
    }

    fn retained(&self) -> usize {
        self.segment.read().records.len()
    }
}

struct Topic {
    retention_ms: Option<u64>,
    partitions: Vec<Arc<PartitionLog>>,
}

struct ClusterState {
    cluster_id: String,
    topics: DashMap<String, Arc<Topic>>,
}

impl ClusterState {
    fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError> {
        let existing = self
            .topics
            .entry(spec.name.clone())
            .or_insert_with(|| {
                debug!(topic = %spec.name, partitions = spec.partitions, retention_ms = ?spec.retention_ms, "Created topic");
                Arc::new(Topic {
                    retention_ms: spec.retention_ms,
                    partitions: (0..spec.partitions)
                        .map(|_| Arc::new(PartitionLog::new(spec.retention_ms)))
                        .collect(),
                })
            })
            .partitions
            .len() as u32;
        if existing != spec.partitions {
            return Err(BrokerError::TopicMismatch(spec.name.clone()));
        }
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Option<u32> {
        self.topics.get(topic).map(|t| t.partitions.len() as u32)
    }

    fn partition(&self, topic: &str, partition: u32) -> Result<Arc<PartitionLog>, BrokerError> {
        let topic_state = self
            .topics
            .get(topic)
            .map(|t| t.clone())
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        topic_state
            .partitions
            .get(partition as usize)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }

    fn append(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: Bytes,
        timestamp_ms: i64,
    ) -> Result<RecordMetadata, BrokerError> {
        let log = self.partition(topic, partition)?;
        Ok(log.append(Record {
            topic: topic.to_string(),
            partition,
            offset: 0,
            key: key.to_string(),
            payload,
            timestamp_ms,
        }))
    }

    fn describe(&self) -> ClusterDescription {
        let mut topics: Vec<TopicSpec> = self
            .topics
            .iter()
            .map(|t| TopicSpec {
                name: t.key().clone(),
                partitions: t.partitions.len() as u32,
                retention_ms: t.retention_ms,
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        ClusterDescription {
            cluster_id: self.cluster_id.clone(),
            topics,
        }
    }
}

/// In-process partitioned log addressed as `memory://<cluster-id>`.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<ClusterState>,
}

impl MemoryBroker {
    /// A private cluster, not reachable through `connect`.
    pub fn new(cluster_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(ClusterState {
                cluster_id: cluster_id.into(),
                topics: DashMap::new(),
            }),
        })
    }

    /// Returns the process-wide broker for `cluster_id`, creating it on first use.
    pub fn shared(cluster_id: &str) -> Arc<Self> {
        let state = CLUSTERS
            .entry(cluster_id.to_string())
            .or_insert_with(|| {
                info!(cluster_id, "Starting in-memory broker");
                Arc::new(ClusterState {
                    cluster_id: cluster_id.to_string(),
                    topics: DashMap::new(),
                })
            })
            .clone();
        Arc::new(Self { state })
    }

    /// Offset the next appended record of a partition will get.
    pub fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        Ok(self.state.partition(topic, partition)?.end_offset())
    }

    /// Offset of the oldest record still retained by a partition.
    pub fn start_offset(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        Ok(self.state.partition(topic, partition)?.start_offset())
    }

    /// Number of records a partition currently holds.
    pub fn retained(&self, topic: &str, partition: u32) -> Result<usize, BrokerError> {
        Ok(self.state.partition(topic, partition)?.retained())
    }

    /// Appends a record to an explicit partition, bypassing key hashing.
    pub fn append(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: Bytes,
        timestamp_ms: i64,
    ) -> Result<RecordMetadata, BrokerError> {
        self.state.append(topic, partition, key, payload, timestamp_ms)
    }

    /// Reads up to `max_records` from `offset`, waiting at most `wait` for
    /// the first one. `max_records == 0` only reports the end offset.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_records: usize,
        wait: Duration,
    ) -> Result<FetchResponse, BrokerError> {
        let log = self.state.partition(topic, partition)?;
        let deadline = Instant::now() + wait;
        loop {
            let appended = log.appended.notified();
            let records = log.read(offset, max_records);
            if !records.is_empty() || max_records == 0 {
                return Ok(FetchResponse {
                    records,
                    end_offset: log.end_offset(),
                });
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(FetchResponse {
                    records,
                    end_offset: log.end_offset(),
                });
            }
        }
    }
}

impl Broker for MemoryBroker {
    fn cluster_id(&self) -> &str {
        &self.state.cluster_id
    }

    fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError> {
        Ok(Arc::new(MemoryProducer {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn admin(&self) -> Result<Arc<dyn BrokerAdmin>, BrokerError> {
        Ok(Arc::new(MemoryAdmin {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn consumer(&self, topic: &str, partition: u32) -> Result<Box<dyn PartitionConsumer>, BrokerError> {
        Ok(Box::new(MemoryConsumer {
            log: self.state.partition(topic, partition)?,
            offset: 0,
        }))
    }
}

struct MemoryProducer {
    state: Arc<ClusterState>,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Bytes,
        timestamp_ms: Option<i64>,
    ) -> Result<RecordMetadata, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let partitions = self
            .state
            .partition_count(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        let timestamp_ms = timestamp_ms.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        self.state
            .append(topic, partition_for(key, partitions), key, payload, timestamp_ms)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAdmin {
    state: Arc<ClusterState>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerAdmin for MemoryAdmin {
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        for spec in topics {
            self.state.create_topic(spec)?;
        }
        Ok(())
    }

    async fn describe_cluster(&self) -> Result<ClusterDescription, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(self.state.describe())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryConsumer {
    log: Arc<PartitionLog>,
    offset: u64,
}

#[async_trait]
impl PartitionConsumer for MemoryConsumer {
    async fn poll(&mut self, max_records: usize) -> Result<Vec<Record>, BrokerError> {
        loop {
            // Register interest before reading so an append in between is not missed.
            let appended = self.log.appended.notified();
            let batch = self.log.read(self.offset, max_records);
            if let Some(last) = batch.last() {
                self.offset = last.offset + 1;
                return Ok(batch);
            }
            appended.await;
        }
    }

    fn position(&self) -> u64 {
        self.offset
    }

    async fn end_offset(&self) -> Result<u64, BrokerError> {
        Ok(self.log.end_offset())
    }
}
