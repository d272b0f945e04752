//! Message broker client abstraction.
//!
//! The stream runtime only depends on these traits. The in-process
//! `memory://` transport owns the partition logs. Nodes in other processes
//! reach that log over HTTP through `http://<host:port>` of the hosting node.

pub mod memory;
pub mod remote;

pub use memory::MemoryBroker;
pub use remote::RemoteBroker;

use crate::error::{BrokerError, ConfigError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// A record read from a topic partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Bytes,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    /// Records older than the newest record of their partition by more than
    /// this are discarded. `None` keeps everything.
    #[serde(default)]
    pub retention_ms: Option<u64>,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: u32) -> Self {
        Self {
            name: name.into(),
            partitions,
            retention_ms: None,
        }
    }

    /// Zero means unbounded.
    pub fn with_retention(mut self, retention_ms: u64) -> Self {
        self.retention_ms = (retention_ms > 0).then_some(retention_ms);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDescription {
    pub cluster_id: String,
    pub topics: Vec<TopicSpec>,
}

/// Publishes keyed records. Shared by every call site in the process.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Appends a record to the partition owning `key`. A `None` timestamp is
    /// stamped with the current wall-clock time.
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Bytes,
        timestamp_ms: Option<i64>,
    ) -> Result<RecordMetadata, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Creates missing topics. Existing topics with the same partition count are left alone.
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<(), BrokerError>;

    async fn describe_cluster(&self) -> Result<ClusterDescription, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Reads one partition of one topic from a starting offset.
#[async_trait]
pub trait PartitionConsumer: Send {
    /// Waits until at least one record is available and returns up to `max_records`.
    async fn poll(&mut self, max_records: usize) -> Result<Vec<Record>, BrokerError>;

    /// Offset of the next record to be returned.
    fn position(&self) -> u64;

    /// Offset one past the last record currently in the partition.
    async fn end_offset(&self) -> Result<u64, BrokerError>;
}

pub trait Broker: Send + Sync {
    fn cluster_id(&self) -> &str;

    fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError>;

    fn admin(&self) -> Result<Arc<dyn BrokerAdmin>, BrokerError>;

    fn consumer(&self, topic: &str, partition: u32) -> Result<Box<dyn PartitionConsumer>, BrokerError>;
}

/// Stable key partitioning shared by producers and the query layer.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    (xxh3_64(key.as_bytes()) % partitions as u64) as u32
}

/// Cluster ID of a `memory://` address, the log this process hosts.
pub fn memory_cluster_id(bootstrap_servers: &str) -> Option<&str> {
    bootstrap_servers
        .trim()
        .strip_prefix("memory://")
        .filter(|id| !id.is_empty())
}

/// Resolves a bootstrap address to a broker client.
pub fn connect(bootstrap_servers: &str) -> Result<Arc<dyn Broker>, ConfigError> {
    let address = bootstrap_servers.trim();
    if let Some(cluster_id) = memory_cluster_id(address) {
        return Ok(MemoryBroker::shared(cluster_id));
    }
    match address.strip_prefix("http://") {
        Some(host) if !host.is_empty() && !host.contains('/') => Ok(Arc::new(RemoteBroker::new(address)?)),
        _ => Err(ConfigError::UnsupportedBroker(address.to_string())),
    }
}
