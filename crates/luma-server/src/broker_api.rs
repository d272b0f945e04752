//! Serves this process's `memory://` partition log to the other nodes of
//! the cluster, which bootstrap from `http://<this node>`.

use crate::api::{decode_segment, error_reply};
use bytes::Bytes;
use luma_trace_core::broker::remote::{FetchParams, ProduceRequest};
use luma_trace_core::broker::{Broker, MemoryBroker, Producer, TopicSpec};
use luma_trace_core::error::BrokerError;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_FETCH_RECORDS: usize = 1_000;
const MAX_FETCH_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BrokerService {
    broker: Arc<MemoryBroker>,
    producer: Arc<dyn Producer>,
}

impl BrokerService {
    pub fn new(broker: Arc<MemoryBroker>) -> Result<Self, BrokerError> {
        let producer = broker.producer()?;
        Ok(Self { broker, producer })
    }
}

fn broker_error_reply(e: BrokerError) -> Response {
    let status = match &e {
        BrokerError::UnknownTopic(_) | BrokerError::UnknownPartition { .. } => StatusCode::NOT_FOUND,
        BrokerError::TopicMismatch(_) => StatusCode::CONFLICT,
        BrokerError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        _ => {
            warn!(error = %e, "Broker request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_reply(status, e.to_string())
}

fn bincode_reply(body: Bytes) -> Response {
    warp::reply::with_header(body.to_vec(), "content-type", "application/octet-stream").into_response()
}

fn with_service(service: BrokerService) -> impl Filter<Extract = (BrokerService,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

async fn create_topics(topics: Vec<TopicSpec>, service: BrokerService) -> Result<Response, Rejection> {
    let result = match service.broker.admin() {
        Ok(admin) => admin.create_topics(&topics).await,
        Err(e) => Err(e),
    };
    Ok(match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => broker_error_reply(e),
    })
}

async fn describe_cluster(service: BrokerService) -> Result<Response, Rejection> {
    let result = match service.broker.admin() {
        Ok(admin) => admin.describe_cluster().await,
        Err(e) => Err(e),
    };
    Ok(match result {
        Ok(cluster) => warp::reply::json(&cluster).into_response(),
        Err(e) => broker_error_reply(e),
    })
}

async fn produce(topic: String, body: Bytes, service: BrokerService) -> Result<Response, Rejection> {
    let request = match ProduceRequest::decode(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_reply(StatusCode::BAD_REQUEST, e.to_string())),
    };
    let topic = decode_segment(&topic);
    Ok(
        match service
            .producer
            .send(&topic, &request.key, request.payload, request.timestamp_ms)
            .await
        {
            Ok(metadata) => warp::reply::json(&metadata).into_response(),
            Err(e) => broker_error_reply(e),
        },
    )
}

async fn fetch(
    topic: String,
    partition: u32,
    params: FetchParams,
    service: BrokerService,
) -> Result<Response, Rejection> {
    let wait = Duration::from_millis(params.wait_ms).min(MAX_FETCH_WAIT);
    let fetched = service
        .broker
        .fetch(
            &decode_segment(&topic),
            partition,
            params.offset,
            params.max.min(MAX_FETCH_RECORDS),
            wait,
        )
        .await;
    Ok(match fetched.map(|response| response.encode()) {
        Ok(Ok(body)) => bincode_reply(body),
        Ok(Err(e)) => error_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => broker_error_reply(e),
    })
}

pub fn broker_routes(service: BrokerService) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let create = warp::path!("broker" / "topics")
        .and(warp::post())
        .and(warp::body::json::<Vec<TopicSpec>>())
        .and(with_service(service.clone()))
        .and_then(create_topics);

    let cluster = warp::path!("broker" / "cluster")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(describe_cluster);

    let send = warp::path!("broker" / "topics" / String / "records")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_service(service.clone()))
        .and_then(produce);

    let poll = warp::path!("broker" / "topics" / String / "partitions" / u32 / "records")
        .and(warp::get())
        .and(warp::query::<FetchParams>())
        .and(with_service(service))
        .and_then(fetch);

    create.or(cluster).unify().or(send).unify().or(poll).unify()
}
