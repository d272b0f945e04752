mod common;

use common::*;
use luma_trace_core::model::{Kind, Span};
use luma_trace_core::{DependencyLink, StorageConfig};
use reqwest::StatusCode;
use serde_json::Value;

fn window_params() -> String {
    let end_ts = chrono::Utc::now().timestamp_millis() + 1_000;
    format!("endTs={}&lookback=60000", end_ts)
}

async fn get(client: &reqwest::Client, url: String) -> (StatusCode, Value) {
    let response = client.get(url).send().await.unwrap();
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_ingest_then_query_public_api() {
    let node = launch_single(storage(&memory_cluster())).await;
    let client = reqwest::Client::new();
    let ts = now_micros();
    let id = trace_id(1);

    post_spans(
        &client,
        &node.base,
        &[
            Span::new(id.clone(), "a")
                .with_name("get /")
                .with_kind(Kind::Client)
                .with_local_service("svc_a")
                .with_timestamp(ts)
                .with_duration(10),
            Span::new(id.clone(), "b")
                .with_parent("a")
                .with_name("get /")
                .with_kind(Kind::Server)
                .with_local_service("svc_b")
                .with_timestamp(ts + 1)
                .with_duration(5),
        ],
    )
    .await;
    flush(&client, &node.base).await;

    let url = format!("{}/api/v2/trace/{}", node.base, id);
    let trace = eventually(|| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let response = client.get(url).send().await.ok()?;
            if response.status() != StatusCode::OK {
                return None;
            }
            response.json::<Vec<Span>>().await.ok()
        }
    })
    .await;
    assert_eq!(trace.len(), 2);

    let (status, services) = get(&client, format!("{}/api/v2/services", node.base)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(services, serde_json::json!(["svc_a", "svc_b"]));

    let (status, found) = get(
        &client,
        format!("{}/api/v2/traces?serviceName=svc_b&{}", node.base, window_params()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found.as_array().unwrap().len(), 1);

    let url = format!("{}/api/v2/dependencies?{}", node.base, window_params());
    let links = eventually(|| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let links = client.get(url).send().await.ok()?.json::<Vec<DependencyLink>>().await.ok()?;
            (!links.is_empty()).then_some(links)
        }
    })
    .await;
    assert_eq!(links, vec![DependencyLink::new("svc_a", "svc_b", 1, 0)]);

    let (status, _) = get(&client, format!("{}/api/v2/trace/{}", node.base, trace_id(2))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The node-local endpoint the coordinator calls.
    let (status, local) = get(&client, format!("{}/traces/{}", node.base, id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(local.as_array().unwrap().len(), 2);

    node.close().await;
}

#[tokio::test]
async fn test_health_instances_and_metrics() {
    let node = launch_single(storage(&memory_cluster())).await;
    let client = reqwest::Client::new();

    let (status, health) = get(&client, format!("{}/health", node.base)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["healthy"], Value::Bool(true));
    assert_eq!(health["topologies"].as_array().unwrap().len(), 3);

    let (status, instances) = get(&client, format!("{}/instances/luma-traces", node.base)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(instances.as_array().unwrap().len(), 1);

    let response = client.get(format!("{}/metrics", node.base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = response.text().await.unwrap();
    assert!(text.contains("luma_trace_spans_accepted_total"));

    node.close().await;
}

#[tokio::test]
async fn test_disabled_queries_answer_not_found_or_empty() {
    let node = launch_single(StorageConfig {
        trace_by_id_query_enabled: false,
        trace_search_enabled: false,
        dependency_query_enabled: false,
        ..storage(&memory_cluster())
    })
    .await;
    let client = reqwest::Client::new();

    for path in [
        format!("/api/v2/trace/{}", trace_id(1)),
        format!("/api/v2/traces?{}", window_params()),
        format!("/api/v2/dependencies?{}", window_params()),
        format!("/traces/{}", trace_id(1)),
    ] {
        let (status, _) = get(&client, format!("{}{}", node.base, path)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", path);
    }

    for path in [
        "/api/v2/services",
        "/api/v2/spans?serviceName=svc",
        "/api/v2/autocompleteKeys",
        "/serviceNames",
    ] {
        let (status, body) = get(&client, format!("{}{}", node.base, path)).await;
        assert_eq!(status, StatusCode::OK, "{}", path);
        assert_eq!(body, serde_json::json!([]), "{}", path);
    }

    node.close().await;
}
