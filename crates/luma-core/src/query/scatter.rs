//! Scatter-gather over the nodes holding a store.
//!
//! Every logical query is sent to each owning node in parallel with a
//! per-call timeout. Failed nodes are left out of the merge; the query only
//! fails when no node answered.

use super::request::QueryRequest;
use crate::cluster::{ClusterMetadata, HostInfo, StreamsMetadata};
use crate::error::QueryError;
use crate::linker::merge_links;
use crate::metrics::SCATTER_GATHER_QUERIES;
use crate::model::{first_span_timestamp, DependencyLink, Span};
use crate::storage::dependency_store::DEPENDENCIES_STORE;
use crate::storage::trace_store::{
    AUTOCOMPLETE_TAGS_STORE, REMOTE_SERVICE_NAMES_STORE, SERVICE_NAMES_STORE, SPAN_NAMES_STORE,
    TRACES_STORE,
};
use futures::future::join_all;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type QueryResult<T> = std::result::Result<T, QueryError>;

/// Why one node contributed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeFailure {
    /// The node answered 503: its stores are still loading.
    NotReady,
    Failed(String),
}

/// Where the set of nodes holding a store comes from.
pub enum Discovery {
    /// Ownership computed from the configured node list.
    Static(Arc<ClusterMetadata>),
    /// Ownership fetched from `GET /instances/{store}` on a seed node.
    Remote(HostInfo),
}

/// Sends `fetch` to every node and collects the answers of the nodes that
/// responded, in node order.
pub async fn scatter<T, F, Fut>(
    store: &str,
    nodes: &[HostInfo],
    timeout: Duration,
    fetch: F,
) -> QueryResult<Vec<T>>
where
    F: Fn(HostInfo) -> Fut,
    Fut: Future<Output = Result<T, NodeFailure>>,
{
    if nodes.is_empty() {
        debug!(store, "No node holds the store");
        SCATTER_GATHER_QUERIES.with_label_values(&[store, "full"]).inc();
        return Ok(Vec::new());
    }

    let calls = nodes.iter().map(|host| {
        let call = fetch(host.clone());
        async move {
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(NodeFailure::Failed(format!("timed out after {:?}", timeout))),
            }
        }
    });
    let answers = join_all(calls).await;

    let mut results = Vec::with_capacity(answers.len());
    let mut failed = 0;
    let mut not_ready = 0;
    for (host, answer) in nodes.iter().zip(answers) {
        match answer {
            Ok(value) => results.push(value),
            Err(NodeFailure::NotReady) => {
                not_ready += 1;
                warn!(store, node = %host, "Node not ready, excluded from result");
            }
            Err(NodeFailure::Failed(reason)) => {
                failed += 1;
                warn!(store, node = %host, error = %reason, "Node query failed, excluded from result");
            }
        }
    }

    if results.is_empty() {
        SCATTER_GATHER_QUERIES.with_label_values(&[store, "failed"]).inc();
        return Err(if not_ready > 0 {
            QueryError::NotReady {
                store: store.to_string(),
            }
        } else {
            QueryError::AllNodesFailed {
                store: store.to_string(),
                nodes: nodes.len(),
            }
        });
    }
    if failed + not_ready > 0 {
        warn!(
            store,
            answered = results.len(),
            failed,
            not_ready,
            "Scatter-gather degraded"
        );
        SCATTER_GATHER_QUERIES.with_label_values(&[store, "degraded"]).inc();
    } else {
        debug!(store, answered = results.len(), "Scatter-gather complete");
        SCATTER_GATHER_QUERIES.with_label_values(&[store, "full"]).inc();
    }
    Ok(results)
}

async fn fetch_json<T: DeserializeOwned>(client: &reqwest::Client, url: Url) -> Result<T, NodeFailure> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| NodeFailure::Failed(e.to_string()))?;
    match response.status() {
        StatusCode::SERVICE_UNAVAILABLE => Err(NodeFailure::NotReady),
        status if status.is_success() => response
            .json::<T>()
            .await
            .map_err(|e| NodeFailure::Failed(e.to_string())),
        status => Err(NodeFailure::Failed(format!("status {}", status))),
    }
}

fn node_url(host: &HostInfo, segments: &[&str], params: &[(&str, String)]) -> Result<Url, NodeFailure> {
    let mut url = Url::parse(&host.base_url()).map_err(|e| NodeFailure::Failed(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| NodeFailure::Failed(format!("{} cannot carry a path", host)))?
        .pop_if_empty()
        .extend(segments);
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}

/// Query-string form of a search request, as the local `/traces` endpoint reads it.
pub fn search_params(request: &QueryRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("endTs", request.end_ts.to_string()),
        ("lookback", request.lookback.to_string()),
        ("limit", request.limit.to_string()),
    ];
    if let Some(service) = &request.service_name {
        params.push(("serviceName", service.clone()));
    }
    if let Some(remote) = &request.remote_service_name {
        params.push(("remoteServiceName", remote.clone()));
    }
    if let Some(name) = &request.span_name {
        params.push(("spanName", name.clone()));
    }
    if !request.annotation_query.is_empty() {
        let terms: Vec<String> = request
            .annotation_query
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{}={}", key, value)
                }
            })
            .collect();
        params.push(("annotationQuery", terms.join(" and ")));
    }
    if let Some(min) = request.min_duration {
        params.push(("minDuration", min.to_string()));
    }
    if let Some(max) = request.max_duration {
        params.push(("maxDuration", max.to_string()));
    }
    params
}

// ============================================================================
// Merge rules
// ============================================================================

/// Point lookups: every node's spans, concatenated.
pub fn concat_spans(answers: Vec<Vec<Span>>) -> Vec<Span> {
    answers.into_iter().flatten().collect()
}

/// Positional lookups: entry `i` is the concatenation of every node's entry `i`.
pub fn merge_positional(answers: Vec<Vec<Option<Vec<Span>>>>, len: usize) -> Vec<Option<Vec<Span>>> {
    let mut merged: Vec<Option<Vec<Span>>> = vec![None; len];
    for answer in answers {
        for (slot, found) in merged.iter_mut().zip(answer) {
            if let Some(spans) = found {
                slot.get_or_insert_with(Vec::new).extend(spans);
            }
        }
    }
    merged
}

/// Search results: one entry per trace ID, newest first, at most `limit`.
pub fn merge_traces(answers: Vec<Vec<Vec<Span>>>, limit: usize) -> Vec<Vec<Span>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged: Vec<Vec<Span>> = answers
        .into_iter()
        .flatten()
        .filter(|trace| match trace.first() {
            Some(span) => seen.insert(span.trace_id.clone()),
            None => false,
        })
        .collect();
    merged.sort_by(|a, b| first_span_timestamp(b).cmp(&first_span_timestamp(a)));
    merged.truncate(limit);
    merged
}

pub fn merge_names(answers: Vec<Vec<String>>) -> Vec<String> {
    answers
        .into_iter()
        .flatten()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

// ============================================================================
// Coordinator
// ============================================================================

/// Answers logical queries by fanning out to the local endpoints of every
/// node holding the relevant store.
#[derive(Clone)]
pub struct ScatterGather {
    client: reqwest::Client,
    discovery: Arc<Discovery>,
    timeout: Duration,
}

impl ScatterGather {
    pub fn new(discovery: Discovery, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            discovery: Arc::new(discovery),
            timeout,
        }
    }

    /// Nodes holding at least one partition of `store`.
    pub async fn nodes_for(&self, store: &str) -> QueryResult<Vec<HostInfo>> {
        let metadata = match self.discovery.as_ref() {
            Discovery::Static(cluster) => cluster.metadata_for_store(store),
            Discovery::Remote(seed) => {
                let url = node_url(seed, &["instances", store], &[])
                    .map_err(|e| QueryError::Discovery(format!("{:?}", e)))?;
                let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
                    .await
                    .map_err(|_| QueryError::Discovery(format!("{} timed out", seed)))??;
                response
                    .error_for_status()?
                    .json::<Vec<StreamsMetadata>>()
                    .await?
            }
        };
        Ok(metadata.into_iter().map(|m| m.host_info).collect())
    }

    async fn gather<T: DeserializeOwned>(
        &self,
        store: &str,
        segments: &[&str],
        params: &[(&str, String)],
    ) -> QueryResult<Vec<T>> {
        let nodes = self.nodes_for(store).await?;
        let client = &self.client;
        scatter(store, &nodes, self.timeout, |host| async move {
            let url = node_url(&host, segments, params)?;
            fetch_json::<T>(client, url).await
        })
        .await
    }

    pub async fn get_trace(&self, trace_id: &str) -> QueryResult<Vec<Span>> {
        let answers = self.gather(TRACES_STORE, &["traces", trace_id], &[]).await?;
        Ok(concat_spans(answers))
    }

    pub async fn get_traces(&self, trace_ids: &[String]) -> QueryResult<Vec<Option<Vec<Span>>>> {
        if trace_ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = [("traceIds", trace_ids.join(","))];
        let answers = self.gather(TRACES_STORE, &["traceMany"], &params).await?;
        Ok(merge_positional(answers, trace_ids.len()))
    }

    pub async fn search(&self, request: &QueryRequest) -> QueryResult<Vec<Vec<Span>>> {
        let params = search_params(request);
        let answers = self.gather(TRACES_STORE, &["traces"], &params).await?;
        Ok(merge_traces(answers, request.limit))
    }

    pub async fn service_names(&self) -> QueryResult<Vec<String>> {
        let answers = self.gather(SERVICE_NAMES_STORE, &["serviceNames"], &[]).await?;
        Ok(merge_names(answers))
    }

    pub async fn span_names(&self, service: &str) -> QueryResult<Vec<String>> {
        let answers = self
            .gather(SPAN_NAMES_STORE, &["serviceNames", service, "spanNames"], &[])
            .await?;
        Ok(merge_names(answers))
    }

    pub async fn remote_service_names(&self, service: &str) -> QueryResult<Vec<String>> {
        let answers = self
            .gather(
                REMOTE_SERVICE_NAMES_STORE,
                &["serviceNames", service, "remoteServiceNames"],
                &[],
            )
            .await?;
        Ok(merge_names(answers))
    }

    pub async fn autocomplete_keys(&self) -> QueryResult<Vec<String>> {
        let answers = self.gather(AUTOCOMPLETE_TAGS_STORE, &["autocompleteTags"], &[]).await?;
        Ok(merge_names(answers))
    }

    pub async fn autocomplete_values(&self, key: &str) -> QueryResult<Vec<String>> {
        let answers = self
            .gather(AUTOCOMPLETE_TAGS_STORE, &["autocompleteTags", key], &[])
            .await?;
        Ok(merge_names(answers))
    }

    pub async fn get_dependencies(&self, end_ts: i64, lookback: i64) -> QueryResult<Vec<DependencyLink>> {
        let params = [("endTs", end_ts.to_string()), ("lookback", lookback.to_string())];
        let answers: Vec<Vec<DependencyLink>> =
            self.gather(DEPENDENCIES_STORE, &["dependencies"], &params).await?;
        Ok(merge_links(answers.into_iter().flatten()))
    }
}
