use crate::cluster::HostInfo;
use crate::codec::Encoding;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Options the storage core needs from its host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bootstrap_servers: String,
    pub ensure_topics: bool,
    pub encoding: Encoding,

    pub spans_topic: String,
    pub spans_partitions: u32,
    pub trace_topic: String,
    pub trace_partitions: u32,
    pub dependency_topic: String,
    pub dependency_partitions: u32,

    pub span_consumer_enabled: bool,
    pub aggregation_enabled: bool,
    pub trace_by_id_query_enabled: bool,
    pub trace_search_enabled: bool,
    pub dependency_query_enabled: bool,

    pub trace_inactivity_gap_ms: u64,
    /// Retention of the spans topic. Zero keeps every span.
    pub spans_retention_ms: u64,
    pub trace_ttl_ms: u64,
    pub trace_ttl_check_interval_ms: u64,
    pub min_traces_stored: usize,
    pub dependency_ttl_ms: u64,
    pub dependency_window_size_ms: u64,
    pub autocomplete_keys: Vec<String>,

    pub close_timeout_ms: u64,
    pub cluster: ClusterConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "memory://luma".to_string(),
            ensure_topics: true,
            encoding: Encoding::Json,
            spans_topic: "zipkin-spans".to_string(),
            spans_partitions: 1,
            trace_topic: "zipkin-trace".to_string(),
            trace_partitions: 1,
            dependency_topic: "zipkin-dependency".to_string(),
            dependency_partitions: 1,
            span_consumer_enabled: true,
            aggregation_enabled: true,
            trace_by_id_query_enabled: true,
            trace_search_enabled: true,
            dependency_query_enabled: true,
            trace_inactivity_gap_ms: MINUTE_MS,
            spans_retention_ms: HOUR_MS,
            trace_ttl_ms: 3 * DAY_MS,
            trace_ttl_check_interval_ms: HOUR_MS,
            min_traces_stored: 10_000,
            dependency_ttl_ms: 7 * DAY_MS,
            dependency_window_size_ms: MINUTE_MS,
            autocomplete_keys: Vec::new(),
            close_timeout_ms: 1_000,
            cluster: ClusterConfig::default(),
        }
    }
}

/// How this node advertises itself and finds its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub advertised_host: String,
    pub advertised_port: u16,
    /// Every node of the cluster as `host:port`, in the same order on all
    /// nodes. Empty means a single-node cluster.
    pub nodes: Vec<String>,
    pub node_index: usize,
    pub scatter_timeout_ms: u64,
    /// `host:port` of a node to ask for the current store holders instead
    /// of trusting the static node list.
    pub discovery_seed: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            advertised_host: "127.0.0.1".to_string(),
            advertised_port: 9411,
            nodes: Vec::new(),
            node_index: 0,
            scatter_timeout_ms: 5_000,
            discovery_seed: None,
        }
    }
}

impl ClusterConfig {
    pub fn hosts(&self) -> Result<Vec<HostInfo>, ConfigError> {
        if self.nodes.is_empty() {
            return Ok(vec![HostInfo::new(self.advertised_host.clone(), self.advertised_port)]);
        }
        self.nodes.iter().map(|n| n.parse()).collect()
    }

    pub fn scatter_timeout(&self) -> Duration {
        Duration::from_millis(self.scatter_timeout_ms)
    }

    pub fn discovery_seed(&self) -> Result<Option<HostInfo>, ConfigError> {
        self.discovery_seed
            .as_deref()
            .filter(|seed| !seed.trim().is_empty())
            .map(|seed| seed.trim().parse())
            .transpose()
    }
}

impl StorageConfig {
    pub fn trace_inactivity_gap(&self) -> Duration {
        Duration::from_millis(self.trace_inactivity_gap_ms)
    }

    pub fn trace_ttl(&self) -> Duration {
        Duration::from_millis(self.trace_ttl_ms)
    }

    pub fn trace_ttl_check_interval(&self) -> Duration {
        Duration::from_millis(self.trace_ttl_check_interval_ms)
    }

    pub fn dependency_ttl(&self) -> Duration {
        Duration::from_millis(self.dependency_ttl_ms)
    }

    pub fn dependency_window_size(&self) -> Duration {
        Duration::from_millis(self.dependency_window_size_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Rejects settings the node cannot run with. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::Invalid("bootstrap_servers must not be empty".into()));
        }
        let bootstrap = self.bootstrap_servers.trim();
        if !bootstrap.starts_with("memory://") && !bootstrap.starts_with("http://") {
            return Err(ConfigError::UnsupportedBroker(self.bootstrap_servers.clone()));
        }
        for (topic, partitions) in [
            (&self.spans_topic, self.spans_partitions),
            (&self.trace_topic, self.trace_partitions),
            (&self.dependency_topic, self.dependency_partitions),
        ] {
            if topic.trim().is_empty() {
                return Err(ConfigError::Invalid("topic names must not be empty".into()));
            }
            if partitions == 0 {
                return Err(ConfigError::Invalid(format!("topic {} needs at least one partition", topic)));
            }
        }
        if self.trace_inactivity_gap_ms == 0 {
            return Err(ConfigError::Invalid("trace_inactivity_gap_ms must be positive".into()));
        }
        if self.spans_retention_ms > 0 && self.spans_retention_ms < self.trace_inactivity_gap_ms {
            return Err(ConfigError::Invalid(
                "spans_retention_ms must not be shorter than trace_inactivity_gap_ms".into(),
            ));
        }
        if self.dependency_window_size_ms == 0 {
            return Err(ConfigError::Invalid("dependency_window_size_ms must be positive".into()));
        }
        if self.trace_ttl_ms > 0 && self.trace_ttl_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "trace_ttl_check_interval_ms must be positive when trace_ttl_ms is set".into(),
            ));
        }
        let hosts = self.cluster.hosts()?;
        if self.cluster.node_index >= hosts.len() {
            return Err(ConfigError::Invalid(format!(
                "node_index {} outside cluster of {} nodes",
                self.cluster.node_index,
                hosts.len()
            )));
        }
        // A memory:// log lives in one process: only node 0 may host it.
        if hosts.len() > 1 && self.cluster.node_index != 0 && bootstrap.starts_with("memory://") {
            return Err(ConfigError::Invalid(format!(
                "node {} of a {}-node cluster must bootstrap from http://{} instead of {}",
                self.cluster.node_index,
                hosts.len(),
                hosts[0],
                bootstrap
            )));
        }
        self.cluster.discovery_seed()?;
        Ok(())
    }
}
