#![allow(dead_code)]

use luma_trace_core::model::Span;
use luma_trace_core::{ClusterConfig, StorageConfig, StorageNode};
use luma_trace_server::{server, Config, ShutdownCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A storage node serving HTTP on an ephemeral port.
pub struct TestNode {
    pub node: Arc<StorageNode>,
    pub base: String,
    shutdown: Arc<ShutdownCoordinator>,
    server: Option<JoinHandle<()>>,
}

impl TestNode {
    /// Stops accepting HTTP requests. The storage node keeps running.
    pub async fn stop_http(&mut self) {
        self.shutdown.shutdown();
        if let Some(server) = self.server.take() {
            server.await.unwrap();
        }
    }

    pub async fn close(mut self) {
        self.stop_http().await;
        self.node.close().await;
    }
}

pub fn memory_cluster() -> String {
    format!("memory://http-{}", uuid::Uuid::new_v4())
}

/// Node 0 hosts the log; the others reach it over HTTP.
pub fn bootstrap_for(cluster: &str, addrs: &[String], index: usize) -> String {
    if index == 0 {
        cluster.to_string()
    } else {
        format!("http://{}", addrs[0])
    }
}

pub fn storage(bootstrap_servers: &str) -> StorageConfig {
    StorageConfig {
        bootstrap_servers: bootstrap_servers.to_string(),
        trace_inactivity_gap_ms: 100,
        min_traces_stored: 0,
        ..Default::default()
    }
}

pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Starts a node on `listener`, advertising `nodes` as the cluster.
pub async fn launch(mut storage: StorageConfig, listener: TcpListener, nodes: Vec<String>, index: usize) -> TestNode {
    let addr = listener.local_addr().unwrap();
    storage.cluster = ClusterConfig {
        advertised_port: addr.port(),
        nodes,
        node_index: index,
        scatter_timeout_ms: 2_000,
        discovery_seed: storage.cluster.discovery_seed.take(),
        ..Default::default()
    };
    let config = Config {
        storage,
        ..Default::default()
    };

    let node = Arc::new(StorageNode::new(config.storage.clone()).unwrap());
    node.start().await.unwrap();
    for _ in 0..100 {
        if node.health().healthy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(node.health().healthy, "node did not become ready");

    let shutdown = ShutdownCoordinator::new();
    let routes = server::routes(node.clone(), &config);
    let server = tokio::spawn(server::serve(routes, listener, shutdown.clone()));
    TestNode {
        node,
        base: format!("http://{}", addr),
        shutdown,
        server: Some(server),
    }
}

pub async fn launch_single(storage: StorageConfig) -> TestNode {
    let (listener, _) = bind().await;
    launch(storage, listener, Vec::new(), 0).await
}

pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

pub fn trace_id(n: u64) -> String {
    format!("{:016x}", n)
}

/// Posts one root span per trace to `/api/v2/spans`.
pub async fn post_spans(client: &reqwest::Client, base: &str, spans: &[Span]) {
    let response = client
        .post(format!("{}/api/v2/spans", base))
        .json(spans)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
}

/// Sends spans on many fresh traces so every spans partition moves its
/// stream time past the inactivity gap.
pub async fn flush(client: &reqwest::Client, base: &str) {
    tokio::time::sleep(Duration::from_millis(250)).await;
    let spans: Vec<Span> = (0..64)
        .map(|i| {
            let id = trace_id(0xf000 + i);
            Span::new(id.clone(), id)
        })
        .collect();
    post_spans(client, base, &spans).await;
}

pub async fn eventually<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..250 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
