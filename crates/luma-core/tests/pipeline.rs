use luma_trace_core::model::Kind;
use luma_trace_core::{DependencyLink, QueryRequest, Span, StorageConfig, StorageNode};
use std::time::Duration;

fn config() -> StorageConfig {
    StorageConfig {
        bootstrap_servers: format!("memory://pipeline-{}", uuid::Uuid::new_v4()),
        trace_inactivity_gap_ms: 100,
        min_traces_stored: 0,
        ..Default::default()
    }
}

async fn started_node(config: StorageConfig) -> StorageNode {
    let node = StorageNode::new(config).unwrap();
    node.start().await.unwrap();
    for _ in 0..100 {
        if node.health().healthy {
            return node;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("node did not become ready");
}

async fn eventually<T, F>(mut probe: F) -> T
where
    F: FnMut() -> Option<T>,
{
    for _ in 0..250 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[tokio::test]
async fn test_spans_become_queryable_trace_and_dependency() {
    let node = started_node(config()).await;
    let consumer = node.span_consumer().await.unwrap();
    let ts = now_micros();

    consumer
        .accept(vec![
            Span::new("a", "a")
                .with_name("get")
                .with_kind(Kind::Client)
                .with_local_service("svc_a")
                .with_timestamp(ts)
                .with_duration(10),
            Span::new("a", "b")
                .with_name("get")
                .with_kind(Kind::Server)
                .with_local_service("svc_b")
                .with_timestamp(ts + 1)
                .with_duration(5),
        ])
        .await
        .unwrap();

    // A later span advances stream time past the inactivity gap.
    tokio::time::sleep(Duration::from_millis(250)).await;
    consumer.accept(vec![Span::new("c", "c")]).await.unwrap();

    let view = node.trace_view().clone();
    let trace = eventually(|| view.get_trace("a").ok().filter(|t| !t.is_empty())).await;
    assert_eq!(trace.len(), 2);
    assert!(view.get_trace("c").unwrap().is_empty());

    let end_ts = chrono::Utc::now().timestamp_millis() + 1_000;
    let found = view
        .search(&QueryRequest::new(end_ts).service_name("svc_b").lookback(60_000))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(view.service_names().unwrap(), vec!["svc_a", "svc_b"]);

    let dependencies = node.dependency_view().clone();
    let links = eventually(|| {
        dependencies
            .get_dependencies(end_ts, 3_600_000)
            .ok()
            .filter(|l| !l.is_empty())
    })
    .await;
    assert_eq!(links, vec![DependencyLink::new("svc_a", "svc_b", 1, 0)]);

    node.close().await;
}

#[tokio::test]
async fn test_disabled_span_consumer_drops_spans() {
    let node = started_node(StorageConfig {
        span_consumer_enabled: false,
        ..config()
    })
    .await;
    let consumer = node.span_consumer().await.unwrap();
    assert!(!consumer.is_enabled());
    consumer.accept(vec![Span::new("a", "a")]).await.unwrap();
    node.close().await;
}

#[tokio::test]
async fn test_multiple_partitions_split_across_tasks() {
    let node = started_node(StorageConfig {
        spans_partitions: 4,
        trace_partitions: 4,
        ..config()
    })
    .await;
    let consumer = node.span_consumer().await.unwrap();
    let ts = now_micros();
    let ids = ["1", "2", "3", "4", "5", "6"];
    for id in ids {
        consumer
            .accept(vec![Span::new(id, id).with_local_service("svc").with_timestamp(ts)])
            .await
            .unwrap();
    }

    // Every spans partition needs its own later record to close its sessions.
    tokio::time::sleep(Duration::from_millis(250)).await;
    for i in 0..64 {
        let id = format!("f{}", i);
        consumer.accept(vec![Span::new(id.clone(), id)]).await.unwrap();
    }

    let view = node.trace_view().clone();
    let traces = eventually(|| {
        let found = view.get_traces(&ids.map(String::from)).ok()?;
        found.iter().all(Option::is_some).then_some(found)
    })
    .await;
    assert_eq!(traces.len(), ids.len());
    node.close().await;
}
