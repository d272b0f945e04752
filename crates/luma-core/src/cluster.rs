//! Partition ownership across the nodes of a cluster.
//!
//! Every node is configured with the same ordered node list. Partition `p`
//! of any topic belongs to node `p % nodes`, so each node can answer
//! ownership questions for the whole cluster without coordination.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostInfo {
    pub host: String,
    pub port: u16,
}

impl HostInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostInfo {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("expected host:port, got {}", s)))?;
        let port = port
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid port in {}", s)))?;
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!("missing host in {}", s)));
        }
        Ok(HostInfo::new(host, port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

/// What one node holds, as served by `GET /instances`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamsMetadata {
    pub host_info: HostInfo,
    pub store_names: Vec<String>,
    pub topic_partitions: Vec<TopicPartition>,
}

#[derive(Debug, Clone)]
struct StoreSource {
    topic: String,
    partitions: u32,
    stores: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    hosts: Vec<HostInfo>,
    local_index: usize,
    sources: Vec<StoreSource>,
}

impl ClusterMetadata {
    pub fn new(hosts: Vec<HostInfo>, local_index: usize) -> Self {
        Self {
            hosts,
            local_index,
            sources: Vec::new(),
        }
    }

    /// Declares that `stores` are built from `topic`. Disabled topologies
    /// register no stores and are skipped.
    pub fn register(&mut self, topic: &str, partitions: u32, stores: Vec<String>) {
        if stores.is_empty() {
            return;
        }
        self.sources.push(StoreSource {
            topic: topic.to_string(),
            partitions,
            stores,
        });
    }

    pub fn hosts(&self) -> &[HostInfo] {
        &self.hosts
    }

    pub fn local(&self) -> &HostInfo {
        &self.hosts[self.local_index]
    }

    pub fn local_index(&self) -> usize {
        self.local_index
    }

    pub fn assigned_partitions(&self, node: usize, partitions: u32) -> Vec<u32> {
        let nodes = self.hosts.len().max(1) as u32;
        (0..partitions).filter(|p| (p % nodes) as usize == node).collect()
    }

    pub fn local_partitions(&self, partitions: u32) -> Vec<u32> {
        self.assigned_partitions(self.local_index, partitions)
    }

    fn node_metadata(&self, node: usize) -> StreamsMetadata {
        let mut store_names = Vec::new();
        let mut topic_partitions = Vec::new();
        for source in &self.sources {
            let owned = self.assigned_partitions(node, source.partitions);
            if owned.is_empty() {
                continue;
            }
            store_names.extend(source.stores.iter().cloned());
            topic_partitions.extend(owned.into_iter().map(|partition| TopicPartition {
                topic: source.topic.clone(),
                partition,
            }));
        }
        store_names.sort();
        store_names.dedup();
        StreamsMetadata {
            host_info: self.hosts[node].clone(),
            store_names,
            topic_partitions,
        }
    }

    pub fn all_metadata(&self) -> Vec<StreamsMetadata> {
        (0..self.hosts.len()).map(|n| self.node_metadata(n)).collect()
    }

    /// Nodes holding at least one partition of `store`.
    pub fn metadata_for_store(&self, store: &str) -> Vec<StreamsMetadata> {
        self.all_metadata()
            .into_iter()
            .filter(|m| m.store_names.iter().any(|s| s == store))
            .collect()
    }
}
