//! Public Zipkin-style API answered across the whole cluster.

use crate::api::{decode_segment, error_reply, with_node, DependencyParams, SearchParams, TraceManyParams};
use luma_trace_core::query::ScatterGather;
use luma_trace_core::{QueryError, Span, StorageNode, StoreError};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, warn};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceParams {
    pub service_name: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyParams {
    pub key: String,
}

fn query_reply<T: Serialize>(result: Result<T, QueryError>) -> Response {
    match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e @ QueryError::NotReady { .. }) => error_reply(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        Err(e @ QueryError::AllNodesFailed { .. }) => {
            warn!(error = %e, "Query failed on every node");
            error_reply(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(QueryError::Store(e @ StoreError::Disabled { .. })) => error_reply(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => {
            error!(error = %e, "Query failed");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn disabled(store: &str) -> QueryError {
    QueryError::Store(StoreError::Disabled {
        store: store.to_string(),
    })
}

fn with_coordinator(
    coordinator: ScatterGather,
) -> impl Filter<Extract = (ScatterGather,), Error = Infallible> + Clone {
    warp::any().map(move || coordinator.clone())
}

async fn get_trace(id: String, node: Arc<StorageNode>, sg: ScatterGather) -> Result<Response, Rejection> {
    if !node.config().trace_by_id_query_enabled {
        return Ok(query_reply::<()>(Err(disabled("trace-by-id"))));
    }
    let id = decode_segment(&id);
    Ok(match sg.get_trace(&id).await {
        Ok(spans) if spans.is_empty() => error_reply(StatusCode::NOT_FOUND, format!("trace {} not found", id)),
        result => query_reply(result),
    })
}

async fn get_traces(params: TraceManyParams, node: Arc<StorageNode>, sg: ScatterGather) -> Result<Response, Rejection> {
    if !node.config().trace_by_id_query_enabled {
        return Ok(query_reply::<()>(Err(disabled("trace-by-id"))));
    }
    let result = sg
        .get_traces(&params.ids())
        .await
        .map(|found| found.into_iter().flatten().collect::<Vec<Vec<Span>>>());
    Ok(query_reply(result))
}

async fn search(params: SearchParams, node: Arc<StorageNode>, sg: ScatterGather) -> Result<Response, Rejection> {
    if !node.config().trace_search_enabled {
        return Ok(query_reply::<()>(Err(disabled("trace-search"))));
    }
    Ok(query_reply(sg.search(&params.into_request()).await))
}

/// Name lists answer empty when search is disabled.
async fn names<F, Fut>(node: Arc<StorageNode>, fetch: F) -> Result<Response, Rejection>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<String>, QueryError>>,
{
    if !node.config().trace_search_enabled {
        return Ok(warp::reply::json(&Vec::<String>::new()).into_response());
    }
    Ok(query_reply(fetch().await))
}

async fn dependencies(params: DependencyParams, node: Arc<StorageNode>, sg: ScatterGather) -> Result<Response, Rejection> {
    if !node.config().dependency_query_enabled {
        return Ok(query_reply::<()>(Err(disabled("dependencies"))));
    }
    let (end_ts, lookback) = params.window();
    Ok(query_reply(sg.get_dependencies(end_ts, lookback).await))
}

async fn accept_spans(spans: Vec<Span>, node: Arc<StorageNode>) -> Result<Response, Rejection> {
    let consumer = match node.span_consumer().await {
        Ok(consumer) => consumer,
        Err(e) => return Ok(error_reply(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    };
    Ok(match consumer.accept(spans).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!(error = %e, "Failed to accept spans");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    })
}

pub fn api_v2_routes(
    node: Arc<StorageNode>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let sg = node.coordinator();
    let api = warp::path("api").and(warp::path("v2"));

    let trace = api
        .clone()
        .and(warp::path!("trace" / String))
        .and(warp::get())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg.clone()))
        .and_then(get_trace);

    let trace_many = api
        .clone()
        .and(warp::path!("traceMany"))
        .and(warp::get())
        .and(warp::query::<TraceManyParams>())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg.clone()))
        .and_then(get_traces);

    let traces = api
        .clone()
        .and(warp::path!("traces"))
        .and(warp::get())
        .and(warp::query::<SearchParams>())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg.clone()))
        .and_then(search);

    let services = api
        .clone()
        .and(warp::path!("services"))
        .and(warp::get())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg.clone()))
        .and_then(|node: Arc<StorageNode>, sg: ScatterGather| async move {
            names(node, || async move { sg.service_names().await }).await
        });

    let spans = api
        .clone()
        .and(warp::path!("spans"))
        .and(warp::get())
        .and(warp::query::<ServiceParams>())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg.clone()))
        .and_then(|params: ServiceParams, node: Arc<StorageNode>, sg: ScatterGather| async move {
            names(node, || async move { sg.span_names(&params.service_name).await }).await
        });

    let remote_services = api
        .clone()
        .and(warp::path!("remoteServices"))
        .and(warp::get())
        .and(warp::query::<ServiceParams>())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg.clone()))
        .and_then(|params: ServiceParams, node: Arc<StorageNode>, sg: ScatterGather| async move {
            names(node, || async move { sg.remote_service_names(&params.service_name).await }).await
        });

    let autocomplete_keys = api
        .clone()
        .and(warp::path!("autocompleteKeys"))
        .and(warp::get())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg.clone()))
        .and_then(|node: Arc<StorageNode>, sg: ScatterGather| async move {
            names(node, || async move { sg.autocomplete_keys().await }).await
        });

    let autocomplete_values = api
        .clone()
        .and(warp::path!("autocompleteValues"))
        .and(warp::get())
        .and(warp::query::<KeyParams>())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg.clone()))
        .and_then(|params: KeyParams, node: Arc<StorageNode>, sg: ScatterGather| async move {
            names(node, || async move { sg.autocomplete_values(&params.key).await }).await
        });

    let deps = api
        .clone()
        .and(warp::path!("dependencies"))
        .and(warp::get())
        .and(warp::query::<DependencyParams>())
        .and(with_node(node.clone()))
        .and(with_coordinator(sg))
        .and_then(dependencies);

    let post_spans = api
        .and(warp::path!("spans"))
        .and(warp::post())
        .and(warp::body::json::<Vec<Span>>())
        .and(with_node(node))
        .and_then(accept_spans);

    trace
        .or(trace_many)
        .unify()
        .or(traces)
        .unify()
        .or(services)
        .unify()
        .or(spans)
        .unify()
        .or(remote_services)
        .unify()
        .or(autocomplete_keys)
        .unify()
        .or(autocomplete_values)
        .unify()
        .or(deps)
        .unify()
        .or(post_spans)
        .unify()
}
