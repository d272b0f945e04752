mod common;

use common::*;
use luma_trace_core::broker::partition_for;
use luma_trace_core::model::Span;
use luma_trace_core::query::{Discovery, QueryRequest, ScatterGather};
use luma_trace_core::{QueryError, StorageConfig};
use reqwest::StatusCode;
use std::collections::BTreeSet;
use std::time::Duration;

const NODES: usize = 3;

fn search_url(base: &str) -> String {
    let end_ts = chrono::Utc::now().timestamp_millis() + 1_000;
    format!(
        "{}/api/v2/traces?serviceName=svc&endTs={}&lookback=60000&limit=100",
        base, end_ts
    )
}

async fn found_ids(client: &reqwest::Client, base: &str) -> Option<BTreeSet<String>> {
    let response = client.get(search_url(base)).send().await.ok()?;
    if response.status() != StatusCode::OK {
        return None;
    }
    let traces = response.json::<Vec<Vec<Span>>>().await.ok()?;
    Some(traces.into_iter().map(|t| t[0].trace_id.clone()).collect())
}

#[tokio::test]
async fn test_scatter_gather_survives_a_lost_node() {
    let cluster = memory_cluster();
    let mut listeners = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..NODES {
        let (listener, addr) = bind().await;
        listeners.push(listener);
        addrs.push(addr);
    }

    let mut nodes = Vec::new();
    for (index, listener) in listeners.into_iter().enumerate() {
        let mut storage = StorageConfig {
            spans_partitions: NODES as u32,
            trace_partitions: NODES as u32,
            ..storage(&bootstrap_for(&cluster, &addrs, index))
        };
        if index == 2 {
            storage.cluster.discovery_seed = Some(addrs[0].clone());
        }
        nodes.push(launch(storage, listener, addrs.clone(), index).await);
    }
    assert!(nodes[1].node.health().cluster_id.starts_with("http://"));

    let client = reqwest::Client::new();
    let ts = now_micros();
    let ids: Vec<String> = (1..=9).map(trace_id).collect();
    let spans: Vec<Span> = ids
        .iter()
        .map(|id| Span::new(id.clone(), id.clone()).with_local_service("svc").with_timestamp(ts))
        .collect();
    post_spans(&client, &nodes[0].base, &spans).await;
    flush(&client, &nodes[0].base).await;

    let all: BTreeSet<String> = ids.iter().cloned().collect();
    let base = nodes[0].base.clone();
    let found = eventually(|| {
        let client = client.clone();
        let base = base.clone();
        let all = all.clone();
        async move { found_ids(&client, &base).await.filter(|found| *found == all) }
    })
    .await;
    assert_eq!(found.len(), ids.len());

    // The third node learns the store holders from node 0 instead of its own list.
    let base = nodes[2].base.clone();
    eventually(|| {
        let client = client.clone();
        let base = base.clone();
        let all = all.clone();
        async move { found_ids(&client, &base).await.filter(|found| *found == all) }
    })
    .await;
    let seeded = ScatterGather::new(Discovery::Remote(addrs[1].parse().unwrap()), Duration::from_secs(2));
    assert_eq!(seeded.nodes_for("luma-traces").await.unwrap().len(), NODES);

    // Losing a node drops exactly the traces held by its partition.
    nodes[2].stop_http().await;
    let expected: BTreeSet<String> = ids
        .iter()
        .filter(|id| partition_for(id, NODES as u32) as usize % NODES != 2)
        .cloned()
        .collect();
    let degraded = found_ids(&client, &nodes[0].base).await.unwrap();
    assert_eq!(degraded, expected);

    if let Some(lost) = ids.iter().find(|id| !expected.contains(*id)) {
        let response = client
            .get(format!("{}/api/v2/trace/{}", nodes[0].base, lost))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    nodes[0].stop_http().await;
    nodes[1].stop_http().await;
    let coordinator = ScatterGather::new(
        Discovery::Static(nodes[0].node.cluster()),
        Duration::from_millis(500),
    );
    let end_ts = chrono::Utc::now().timestamp_millis();
    let result = coordinator
        .search(&QueryRequest::new(end_ts).service_name("svc"))
        .await;
    assert!(matches!(result, Err(QueryError::AllNodesFailed { nodes: 3, .. })));

    for node in nodes {
        node.close().await;
    }
}

#[tokio::test]
async fn test_every_node_reports_the_same_ownership() {
    let cluster = memory_cluster();
    let mut listeners = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..NODES {
        let (listener, addr) = bind().await;
        listeners.push(listener);
        addrs.push(addr);
    }
    let mut nodes = Vec::new();
    for (index, listener) in listeners.into_iter().enumerate() {
        let storage = StorageConfig {
            trace_partitions: NODES as u32,
            ..storage(&bootstrap_for(&cluster, &addrs, index))
        };
        nodes.push(launch(storage, listener, addrs.clone(), index).await);
    }

    let client = reqwest::Client::new();
    let mut views = Vec::new();
    for node in &nodes {
        let instances: serde_json::Value = client
            .get(format!("{}/instances", node.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        views.push(instances);
    }
    assert!(views.windows(2).all(|w| w[0] == w[1]));

    // One dependency partition: only the first node holds that store.
    let holders: serde_json::Value = client
        .get(format!("{}/instances/luma-dependencies", nodes[1].base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let holders = holders.as_array().unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(
        format!("{}:{}", holders[0]["hostInfo"]["host"].as_str().unwrap(), holders[0]["hostInfo"]["port"]),
        addrs[0]
    );

    for node in nodes {
        node.close().await;
    }
}
