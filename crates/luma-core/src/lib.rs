//! Partitioned trace storage on top of a stream-processing runtime.
//!
//! Spans are consumed from a keyed topic, session-windowed into traces,
//! turned into service dependency links and materialized into per-partition
//! stores. Each node answers queries for the partitions it owns; the
//! scatter-gather coordinator presents the whole cluster as one store.

pub mod aggregation;
pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod linker;
pub mod metrics;
pub mod model;
pub mod node;
pub mod query;
pub mod storage;
pub mod stream;
pub mod trace;

pub use cluster::{ClusterMetadata, HostInfo, StreamsMetadata};
pub use codec::Encoding;
pub use config::{ClusterConfig, StorageConfig};
pub use consumer::SpanConsumer;
pub use error::{Error, QueryError, Result, StoreError};
pub use model::{DependencyLink, Endpoint, Kind, Span};
pub use node::{NodeHealth, StorageNode};
pub use query::{QueryRequest, ScatterGather};
pub use stream::EngineState;
