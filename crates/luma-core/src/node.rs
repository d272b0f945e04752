//! One storage node: broker clients, the three topologies and their views.
//!
//! Shared resources are created at most once, on first use, and closed once
//! in reverse order of creation.

use crate::aggregation;
use crate::broker::{self, Broker, BrokerAdmin, Producer, TopicSpec};
use crate::cluster::{ClusterMetadata, HostInfo};
use crate::config::StorageConfig;
use crate::consumer::SpanConsumer;
use crate::error::{BrokerError, Result};
use crate::query::{Discovery, ScatterGather};
use crate::storage::dependency_store::{self, DependencyStoreView};
use crate::storage::trace_store::{self, TraceStoreView};
use crate::stream::{EngineState, StateHandle, StreamEngine, Topology};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct TopologyStatus {
    pub name: String,
    pub state: EngineState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub healthy: bool,
    pub cluster_id: String,
    pub topologies: Vec<TopologyStatus>,
}

pub struct StorageNode {
    config: StorageConfig,
    broker: Arc<dyn Broker>,
    cluster: Arc<ClusterMetadata>,
    discovery_seed: Option<HostInfo>,

    producer: OnceCell<Arc<dyn Producer>>,
    admin: OnceCell<Arc<dyn BrokerAdmin>>,
    aggregation: OnceCell<StreamEngine>,
    trace_store: OnceCell<StreamEngine>,
    dependency_store: OnceCell<StreamEngine>,

    aggregation_state: StateHandle,
    trace_state: StateHandle,
    dependency_state: StateHandle,
    trace_view: TraceStoreView,
    dependency_view: DependencyStoreView,

    closed: AtomicBool,
}

impl StorageNode {
    /// Validates `config` and resolves the broker. Nothing is started yet.
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let broker = broker::connect(&config.bootstrap_servers)?;
        Self::with_broker(config, broker)
    }

    pub fn with_broker(config: StorageConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        let hosts = config.cluster.hosts()?;
        let discovery_seed = config.cluster.discovery_seed()?;
        let mut cluster = ClusterMetadata::new(hosts, config.cluster.node_index);

        let aggregation_state = StateHandle::new(EngineState::Created);
        let trace_state = StateHandle::new(EngineState::Created);
        let dependency_state = StateHandle::new(EngineState::Created);
        let trace_view = TraceStoreView::new(trace_state.clone(), config.min_traces_stored);
        let dependency_view = DependencyStoreView::new(dependency_state.clone());

        for (topology, partitions, state) in [
            (aggregation::topology(&config), config.spans_partitions, &aggregation_state),
            (trace_store::topology(&config, &trace_view), config.trace_partitions, &trace_state),
            (
                dependency_store::topology(&config, &dependency_view),
                config.dependency_partitions,
                &dependency_state,
            ),
        ] {
            let description = topology.describe();
            if let Some(topic) = &description.source_topic {
                cluster.register(topic, partitions, description.stores);
            } else {
                state.set(EngineState::Disabled);
            }
        }

        Ok(Self {
            config,
            broker,
            cluster: Arc::new(cluster),
            discovery_seed,
            producer: OnceCell::new(),
            admin: OnceCell::new(),
            aggregation: OnceCell::new(),
            trace_store: OnceCell::new(),
            dependency_store: OnceCell::new(),
            aggregation_state,
            trace_state,
            dependency_state,
            trace_view,
            dependency_view,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn cluster(&self) -> Arc<ClusterMetadata> {
        self.cluster.clone()
    }

    pub fn trace_view(&self) -> &TraceStoreView {
        &self.trace_view
    }

    pub fn dependency_view(&self) -> &DependencyStoreView {
        &self.dependency_view
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed.into());
        }
        Ok(())
    }

    pub async fn producer(&self) -> Result<Arc<dyn Producer>> {
        self.ensure_open()?;
        let producer = self
            .producer
            .get_or_try_init(|| async { self.broker.producer() })
            .await?;
        Ok(producer.clone())
    }

    pub async fn admin(&self) -> Result<Arc<dyn BrokerAdmin>> {
        self.ensure_open()?;
        let admin = self
            .admin
            .get_or_try_init(|| async { self.broker.admin() })
            .await?;
        Ok(admin.clone())
    }

    pub async fn span_consumer(&self) -> Result<SpanConsumer> {
        if !self.config.span_consumer_enabled {
            return Ok(SpanConsumer::Noop);
        }
        Ok(SpanConsumer::new(
            self.producer().await?,
            self.config.spans_topic.clone(),
            self.config.encoding,
        ))
    }

    /// Coordinator answering queries across every node of the cluster. With
    /// a discovery seed the holders of each store are asked of that node.
    pub fn coordinator(&self) -> ScatterGather {
        let discovery = match &self.discovery_seed {
            Some(seed) => Discovery::Remote(seed.clone()),
            None => Discovery::Static(self.cluster.clone()),
        };
        ScatterGather::new(discovery, self.config.cluster.scatter_timeout())
    }

    /// Creates the spans, trace and dependency topics. Safe to repeat.
    pub async fn ensure_topics(&self) -> Result<()> {
        let config = &self.config;
        let topics = [
            TopicSpec::new(&config.spans_topic, config.spans_partitions)
                .with_retention(config.spans_retention_ms),
            TopicSpec::new(&config.trace_topic, config.trace_partitions)
                .with_retention(config.trace_ttl_ms),
            TopicSpec::new(&config.dependency_topic, config.dependency_partitions)
                .with_retention(config.dependency_ttl_ms),
        ];
        self.admin().await?.create_topics(&topics).await?;
        info!(cluster_id = self.broker.cluster_id(), "Topics ensured");
        Ok(())
    }

    async fn engine<'a>(
        &'a self,
        cell: &'a OnceCell<StreamEngine>,
        topology: impl FnOnce() -> Topology,
        partitions: u32,
        state: &StateHandle,
    ) -> Result<&'a StreamEngine> {
        cell.get_or_try_init(|| async move {
            let producer = self.producer().await?;
            Ok::<_, crate::error::Error>(StreamEngine::with_state(
                topology(),
                self.broker.clone(),
                producer,
                self.cluster.local_partitions(partitions),
                state.clone(),
            ))
        })
        .await
    }

    /// Starts every enabled topology on the partitions this node owns.
    pub async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        if self.config.ensure_topics {
            self.ensure_topics().await?;
        }

        let config = &self.config;
        self.engine(
            &self.aggregation,
            || aggregation::topology(config),
            config.spans_partitions,
            &self.aggregation_state,
        )
        .await?
        .start()?;
        self.engine(
            &self.trace_store,
            || trace_store::topology(config, &self.trace_view),
            config.trace_partitions,
            &self.trace_state,
        )
        .await?
        .start()?;
        self.engine(
            &self.dependency_store,
            || dependency_store::topology(config, &self.dependency_view),
            config.dependency_partitions,
            &self.dependency_state,
        )
        .await?
        .start()?;

        info!(
            node = %self.cluster.local(),
            nodes = self.cluster.hosts().len(),
            "Storage node started"
        );
        Ok(())
    }

    pub fn health(&self) -> NodeHealth {
        let topologies: Vec<TopologyStatus> = [
            ("aggregation", &self.aggregation_state),
            ("trace-store", &self.trace_state),
            ("dependency-store", &self.dependency_state),
        ]
        .into_iter()
        .map(|(name, state)| TopologyStatus {
            name: name.to_string(),
            state: state.get(),
        })
        .collect();
        let healthy = !self.closed.load(Ordering::SeqCst)
            && topologies
                .iter()
                .all(|t| matches!(t.state, EngineState::Running | EngineState::Disabled));
        NodeHealth {
            healthy,
            cluster_id: self.broker.cluster_id().to_string(),
            topologies,
        }
    }

    /// Closes engines, then the admin client, then the producer. Each step is
    /// bounded by the close timeout; failures are logged and skipped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let timeout = self.config.close_timeout();
        for cell in [&self.dependency_store, &self.trace_store, &self.aggregation] {
            if let Some(engine) = cell.get() {
                engine.close(timeout).await;
            }
        }
        if let Some(admin) = self.admin.get() {
            close_bounded("admin", timeout, admin.close()).await;
        }
        if let Some(producer) = self.producer.get() {
            close_bounded("producer", timeout, producer.close()).await;
        }
        info!("Storage node closed");
    }
}

async fn close_bounded(
    resource: &str,
    timeout: Duration,
    close: impl Future<Output = std::result::Result<(), BrokerError>>,
) {
    match tokio::time::timeout(timeout, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(resource, error = %e, "Close failed"),
        Err(_) => warn!(resource, "Close timed out after {:?}", timeout),
    }
}
