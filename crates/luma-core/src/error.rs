use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Partition {partition} out of range for topic {topic}")]
    UnknownPartition { topic: String, partition: u32 },

    #[error("Topic {0} already exists with a different partition count")]
    TopicMismatch(String),

    #[error("Broker is closed")]
    Closed,

    #[error("Send timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Broker transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        BrokerError::Transport(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store {store} is not ready")]
    NotReady { store: String },

    #[error("Store {store} is disabled")]
    Disabled { store: String },
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("No node holding {store} is ready")]
    NotReady { store: String },

    #[error("All {nodes} nodes holding {store} failed")]
    AllNodesFailed { store: String, nodes: usize },

    #[error("Metadata lookup failed: {0}")]
    Discovery(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unsupported broker address {0}; expected memory://<cluster-id> or http://<host:port>")]
    UnsupportedBroker(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Topology {0} failed: {1}")]
    Topology(String, String),
}

pub type Result<T> = std::result::Result<T, Error>;
