use crate::api::local_routes;
use crate::api_v2::api_v2_routes;
use crate::broker_api::{broker_routes, BrokerService};
use crate::config::Config;
use crate::infrastructure::ShutdownCoordinator;
use crate::metrics::metrics_route;
use luma_trace_core::broker::{memory_cluster_id, MemoryBroker};
use luma_trace_core::StorageNode;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{error, info};
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Reply};

/// Every HTTP route of one node. A node hosting a `memory://` log also
/// serves it to its peers.
pub fn routes(node: Arc<StorageNode>, config: &Config) -> BoxedFilter<(impl Reply,)> {
    let health_node = node.clone();
    let health = warp::path!("health").and(warp::get()).map(move || {
        let health = health_node.health();
        let status = if health.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        warp::reply::with_status(warp::reply::json(&health), status).into_response()
    });

    let mut routes = health
        .or(api_v2_routes(node.clone()))
        .unify()
        .or(local_routes(node))
        .unify()
        .boxed();

    if let Some(cluster_id) = memory_cluster_id(&config.storage.bootstrap_servers) {
        match BrokerService::new(MemoryBroker::shared(cluster_id)) {
            Ok(service) => routes = routes.or(broker_routes(service)).unify().boxed(),
            Err(e) => error!(cluster_id, error = %e, "Not serving the partition log"),
        }
    }
    if config.metrics.enabled {
        routes = routes.or(metrics_route(config.metrics.path.clone())).unify().boxed();
    }
    routes.with(warp::trace::request()).boxed()
}

/// Serves `routes` on an already-bound listener until `shutdown` fires.
pub async fn serve<R>(routes: BoxedFilter<(R,)>, listener: TcpListener, shutdown: Arc<ShutdownCoordinator>)
where
    R: Reply + Send + 'static,
{
    let incoming = TcpListenerStream::new(listener);
    warp::serve(routes)
        .serve_incoming_with_graceful_shutdown(incoming, async move {
            shutdown.wait_for_shutdown().await;
        })
        .await;
}

pub async fn run(config: Config) -> Result<(), anyhow::Error> {
    let node = Arc::new(StorageNode::new(config.storage.clone())?);
    node.start().await?;

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        address = %listener.local_addr()?,
        node = %node.cluster().local(),
        "Trace storage listening"
    );

    let shutdown = ShutdownCoordinator::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Signal error"),
        }
        signal_shutdown.shutdown();
    });

    serve(routes(node.clone(), &config), listener, shutdown).await;
    node.close().await;
    Ok(())
}
