//! Partition-local state stores and their read-only views.

pub mod dependency_store;
pub mod kv;
pub mod trace_store;

pub use dependency_store::{DependencyStoreView, DEPENDENCIES_STORE};
pub use kv::{KeyValueStore, SkipMapStore};
pub use trace_store::{TraceStoreView, TRACES_STORE};
