//! HTTP client for a partition log hosted by another node.
//!
//! The hosting node runs with a `memory://` bootstrap and serves its log
//! under `/broker`. Record batches travel as bincode, metadata as JSON.

use super::{
    Broker, BrokerAdmin, ClusterDescription, PartitionConsumer, Producer, Record, RecordMetadata,
    TopicSpec,
};
use crate::error::{BrokerError, CodecError, ConfigError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How long the hosting node holds a fetch open waiting for records.
pub const LONG_POLL: Duration = Duration::from_millis(1_000);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `POST /broker/topics/{topic}/records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub key: String,
    pub payload: Bytes,
    pub timestamp_ms: Option<i64>,
}

/// Query of `GET /broker/topics/{topic}/partitions/{partition}/records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchParams {
    pub offset: u64,
    pub max: usize,
    #[serde(default)]
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub records: Vec<Record>,
    pub end_offset: u64,
}

fn to_bincode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

fn from_bincode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

impl ProduceRequest {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        to_bincode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_bincode(bytes)
    }
}

impl FetchResponse {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        to_bincode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        from_bincode(bytes)
    }
}

struct Endpoint {
    base: String,
    client: Client,
}

impl Endpoint {
    fn url(&self, path: &str) -> String {
        format!("{}/broker{}", self.base, path)
    }

    fn records_url(&self, topic: &str, partition: Option<u32>) -> String {
        let topic = percent_encoding::utf8_percent_encode(topic, percent_encoding::NON_ALPHANUMERIC);
        match partition {
            Some(p) => self.url(&format!("/topics/{}/partitions/{}/records", topic, p)),
            None => self.url(&format!("/topics/{}/records", topic)),
        }
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        params: &FetchParams,
    ) -> Result<FetchResponse, BrokerError> {
        let response = self
            .client
            .get(self.records_url(topic, Some(partition)))
            .query(params)
            .send()
            .await?;
        let body = check(response, topic).await?.bytes().await?;
        FetchResponse::decode(&body).map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

/// Maps the hosting node's error statuses back onto broker errors.
async fn check(response: Response, topic: &str) -> Result<Response, BrokerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => BrokerError::UnknownTopic(topic.to_string()),
        StatusCode::CONFLICT => BrokerError::TopicMismatch(topic.to_string()),
        StatusCode::SERVICE_UNAVAILABLE => BrokerError::Closed,
        _ => BrokerError::Transport(format!("{}: {}", status, body)),
    })
}

/// Broker reached at `http://<host:port>` of the node hosting the log.
/// Identified by that address.
pub struct RemoteBroker {
    address: String,
    endpoint: Arc<Endpoint>,
}

impl RemoteBroker {
    pub fn new(address: &str) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("broker client: {}", e)))?;
        let address = address.trim_end_matches('/').to_string();
        Ok(Self {
            endpoint: Arc::new(Endpoint {
                base: address.clone(),
                client,
            }),
            address,
        })
    }
}

impl Broker for RemoteBroker {
    fn cluster_id(&self) -> &str {
        &self.address
    }

    fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError> {
        Ok(Arc::new(RemoteProducer {
            endpoint: self.endpoint.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn admin(&self) -> Result<Arc<dyn BrokerAdmin>, BrokerError> {
        Ok(Arc::new(RemoteAdmin {
            endpoint: self.endpoint.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn consumer(&self, topic: &str, partition: u32) -> Result<Box<dyn PartitionConsumer>, BrokerError> {
        Ok(Box::new(RemoteConsumer {
            endpoint: self.endpoint.clone(),
            topic: topic.to_string(),
            partition,
            offset: 0,
        }))
    }
}

struct RemoteProducer {
    endpoint: Arc<Endpoint>,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for RemoteProducer {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Bytes,
        timestamp_ms: Option<i64>,
    ) -> Result<RecordMetadata, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let body = ProduceRequest {
            key: key.to_string(),
            payload,
            timestamp_ms,
        }
        .encode()
        .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let response = self
            .endpoint
            .client
            .post(self.endpoint.records_url(topic, None))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        Ok(check(response, topic).await?.json().await?)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct RemoteAdmin {
    endpoint: Arc<Endpoint>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerAdmin for RemoteAdmin {
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let response = self
            .endpoint
            .client
            .post(self.endpoint.url("/topics"))
            .json(topics)
            .send()
            .await?;
        let names: Vec<&str> = topics.iter().map(|t| t.name.as_str()).collect();
        check(response, &names.join(",")).await?;
        debug!(broker = %self.endpoint.base, topics = ?names, "Topics created remotely");
        Ok(())
    }

    async fn describe_cluster(&self) -> Result<ClusterDescription, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let response = self.endpoint.client.get(self.endpoint.url("/cluster")).send().await?;
        Ok(check(response, "").await?.json().await?)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct RemoteConsumer {
    endpoint: Arc<Endpoint>,
    topic: String,
    partition: u32,
    offset: u64,
}

#[async_trait]
impl PartitionConsumer for RemoteConsumer {
    async fn poll(&mut self, max_records: usize) -> Result<Vec<Record>, BrokerError> {
        loop {
            let params = FetchParams {
                offset: self.offset,
                max: max_records,
                wait_ms: LONG_POLL.as_millis() as u64,
            };
            let fetched = self.endpoint.fetch(&self.topic, self.partition, &params).await?;
            if let Some(last) = fetched.records.last() {
                self.offset = last.offset + 1;
                return Ok(fetched.records);
            }
        }
    }

    fn position(&self) -> u64 {
        self.offset
    }

    async fn end_offset(&self) -> Result<u64, BrokerError> {
        let params = FetchParams {
            offset: self.offset,
            max: 0,
            wait_ms: 0,
        };
        Ok(self.endpoint.fetch(&self.topic, self.partition, &params).await?.end_offset)
    }
}
