//! Query side: search criteria and the cross-node coordinator.

pub mod request;
pub mod scatter;

pub use request::{parse_annotation_query, QueryRequest, DEFAULT_LIMIT, DEFAULT_LOOKBACK_MS};
pub use scatter::{Discovery, NodeFailure, ScatterGather};
