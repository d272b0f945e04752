//! Per-node endpoints over the store partitions this node owns.
//!
//! These are what the scatter-gather coordinator calls. A store that is
//! still loading answers 503 so callers can tell it apart from "no data".

use luma_trace_core::query::{QueryRequest, DEFAULT_LIMIT, DEFAULT_LOOKBACK_MS};
use luma_trace_core::{StorageConfig, StorageNode, StoreError};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            error: message.into(),
        }),
        status,
    )
    .into_response()
}

/// Path segments arrive percent-encoded.
pub fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// Search parameters shared by the local and the public trace search.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub service_name: Option<String>,
    pub remote_service_name: Option<String>,
    pub span_name: Option<String>,
    pub annotation_query: Option<String>,
    pub min_duration: Option<i64>,
    pub max_duration: Option<i64>,
    pub end_ts: Option<i64>,
    pub lookback: Option<i64>,
    pub limit: Option<usize>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl SearchParams {
    pub fn into_request(self) -> QueryRequest {
        let end_ts = self
            .end_ts
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let mut request = QueryRequest::new(end_ts)
            .lookback(self.lookback.unwrap_or(DEFAULT_LOOKBACK_MS))
            .limit(self.limit.unwrap_or(DEFAULT_LIMIT))
            .duration(self.min_duration, self.max_duration);
        if let Some(service) = non_empty(self.service_name) {
            request = request.service_name(service);
        }
        if let Some(remote) = non_empty(self.remote_service_name) {
            request = request.remote_service_name(remote);
        }
        if let Some(name) = non_empty(self.span_name) {
            request = request.span_name(name);
        }
        if let Some(query) = non_empty(self.annotation_query) {
            request = request.annotation_query(&query);
        }
        request
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceManyParams {
    pub trace_ids: String,
}

impl TraceManyParams {
    pub fn ids(&self) -> Vec<String> {
        self.trace_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyParams {
    pub end_ts: Option<i64>,
    pub lookback: Option<i64>,
}

impl DependencyParams {
    pub fn window(&self) -> (i64, i64) {
        let end_ts = self
            .end_ts
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        (end_ts, self.lookback.unwrap_or(DEFAULT_LOOKBACK_MS))
    }
}

/// What a disabled store answers.
#[derive(Clone, Copy)]
enum WhenDisabled {
    NotFound,
    Empty,
}

fn store_reply<T: Serialize>(result: Result<T, StoreError>, when_disabled: WhenDisabled) -> Response {
    match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e @ StoreError::NotReady { .. }) => error_reply(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        Err(e @ StoreError::Disabled { .. }) => match when_disabled {
            WhenDisabled::NotFound => error_reply(StatusCode::NOT_FOUND, e.to_string()),
            WhenDisabled::Empty => warp::reply::json(&Vec::<String>::new()).into_response(),
        },
    }
}

fn disabled(store: &str) -> StoreError {
    StoreError::Disabled {
        store: store.to_string(),
    }
}

fn check_by_id(config: &StorageConfig) -> Result<(), StoreError> {
    if config.trace_by_id_query_enabled {
        Ok(())
    } else {
        Err(disabled("trace-by-id"))
    }
}

fn check_search(config: &StorageConfig) -> Result<(), StoreError> {
    if config.trace_search_enabled {
        Ok(())
    } else {
        Err(disabled("trace-search"))
    }
}

pub fn with_node(
    node: Arc<StorageNode>,
) -> impl Filter<Extract = (Arc<StorageNode>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || node.clone())
}

pub fn local_routes(
    node: Arc<StorageNode>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let trace = warp::path!("traces" / String)
        .and(warp::get())
        .and(with_node(node.clone()))
        .map(|id: String, node: Arc<StorageNode>| {
            let result = check_by_id(node.config())
                .and_then(|_| node.trace_view().get_trace(&decode_segment(&id)));
            store_reply(result, WhenDisabled::NotFound)
        });

    let trace_many = warp::path!("traceMany")
        .and(warp::get())
        .and(warp::query::<TraceManyParams>())
        .and(with_node(node.clone()))
        .map(|params: TraceManyParams, node: Arc<StorageNode>| {
            let result = check_by_id(node.config())
                .and_then(|_| node.trace_view().get_traces(&params.ids()));
            store_reply(result, WhenDisabled::NotFound)
        });

    let search = warp::path!("traces")
        .and(warp::get())
        .and(warp::query::<SearchParams>())
        .and(with_node(node.clone()))
        .map(|params: SearchParams, node: Arc<StorageNode>| {
            let result = check_search(node.config())
                .and_then(|_| node.trace_view().search(&params.into_request()));
            store_reply(result, WhenDisabled::NotFound)
        });

    let dependencies = warp::path!("dependencies")
        .and(warp::get())
        .and(warp::query::<DependencyParams>())
        .and(with_node(node.clone()))
        .map(|params: DependencyParams, node: Arc<StorageNode>| {
            let (end_ts, lookback) = params.window();
            store_reply(
                node.dependency_view().get_dependencies(end_ts, lookback),
                WhenDisabled::NotFound,
            )
        });

    let service_names = warp::path!("serviceNames")
        .and(warp::get())
        .and(with_node(node.clone()))
        .map(|node: Arc<StorageNode>| {
            let result = check_search(node.config()).and_then(|_| node.trace_view().service_names());
            store_reply(result, WhenDisabled::Empty)
        });

    let span_names = warp::path!("serviceNames" / String / "spanNames")
        .and(warp::get())
        .and(with_node(node.clone()))
        .map(|service: String, node: Arc<StorageNode>| {
            let result = check_search(node.config())
                .and_then(|_| node.trace_view().span_names(&decode_segment(&service)));
            store_reply(result, WhenDisabled::Empty)
        });

    let remote_service_names = warp::path!("serviceNames" / String / "remoteServiceNames")
        .and(warp::get())
        .and(with_node(node.clone()))
        .map(|service: String, node: Arc<StorageNode>| {
            let result = check_search(node.config())
                .and_then(|_| node.trace_view().remote_service_names(&decode_segment(&service)));
            store_reply(result, WhenDisabled::Empty)
        });

    let autocomplete_keys = warp::path!("autocompleteTags")
        .and(warp::get())
        .and(with_node(node.clone()))
        .map(|node: Arc<StorageNode>| {
            let result = check_search(node.config()).and_then(|_| node.trace_view().autocomplete_keys());
            store_reply(result, WhenDisabled::Empty)
        });

    let autocomplete_values = warp::path!("autocompleteTags" / String)
        .and(warp::get())
        .and(with_node(node.clone()))
        .map(|key: String, node: Arc<StorageNode>| {
            let result = check_search(node.config())
                .and_then(|_| node.trace_view().autocomplete_values(&decode_segment(&key)));
            store_reply(result, WhenDisabled::Empty)
        });

    let instances = warp::path!("instances")
        .and(warp::get())
        .and(with_node(node.clone()))
        .map(|node: Arc<StorageNode>| warp::reply::json(&node.cluster().all_metadata()).into_response());

    let store_instances = warp::path!("instances" / String)
        .and(warp::get())
        .and(with_node(node))
        .map(|store: String, node: Arc<StorageNode>| {
            warp::reply::json(&node.cluster().metadata_for_store(&decode_segment(&store))).into_response()
        });

    trace
        .or(trace_many)
        .unify()
        .or(search)
        .unify()
        .or(dependencies)
        .unify()
        .or(service_names)
        .unify()
        .or(span_names)
        .unify()
        .or(remote_service_names)
        .unify()
        .or(autocomplete_keys)
        .unify()
        .or(autocomplete_values)
        .unify()
        .or(instances)
        .unify()
        .or(store_instances)
        .unify()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_params_defaults() {
        let request = SearchParams {
            end_ts: Some(5_000),
            service_name: Some(" ".into()),
            ..Default::default()
        }
        .into_request();
        assert_eq!(request.end_ts, 5_000);
        assert_eq!(request.lookback, DEFAULT_LOOKBACK_MS);
        assert_eq!(request.limit, DEFAULT_LIMIT);
        assert!(request.service_name.is_none());
    }

    #[test]
    fn test_trace_many_ids() {
        let params = TraceManyParams {
            trace_ids: "a, b,,c".into(),
        };
        assert_eq!(params.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_decode_segment() {
        assert_eq!(decode_segment("a%20b%2Fc"), "a b/c");
    }

    #[tokio::test]
    async fn test_path_params_are_decoded_exactly_once() {
        let route = warp::path!("serviceNames" / String / "spanNames");
        let raw = warp::test::request()
            .path("/serviceNames/api%20gateway/spanNames")
            .filter(&route)
            .await
            .unwrap();
        assert_eq!(raw, "api%20gateway");
        assert_eq!(decode_segment(&raw), "api gateway");

        // A literal percent sign survives a single decode.
        let raw = warp::test::request()
            .path("/serviceNames/100%2525/spanNames")
            .filter(&route)
            .await
            .unwrap();
        assert_eq!(decode_segment(&raw), "100%25");
    }
}
