//! Partitioned stream-processing runtime.
//!
//! A [`Topology`] reads one source topic. For every partition assigned to
//! this node the [`StreamEngine`] spawns one task that owns the partition's
//! processor (and therefore its state stores), tracks stream time and runs
//! stream-time punctuations between records.

pub mod window;

use crate::broker::{Broker, PartitionConsumer, Producer, Record};
use crate::error::{Error, Result, StoreError};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MAX_POLL_RECORDS: usize = 500;

// ============================================================================
// Processor API
// ============================================================================

/// A record produced by a processor, sent after the input record is handled.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
    pub timestamp_ms: i64,
}

pub struct ProcessorContext {
    partition: u32,
    stream_time: i64,
    outputs: Vec<OutputRecord>,
}

impl ProcessorContext {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            stream_time: -1,
            outputs: Vec::new(),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Largest record timestamp seen on this partition, or -1 before the first record.
    pub fn stream_time(&self) -> i64 {
        self.stream_time
    }

    pub fn forward(&mut self, topic: &str, key: impl Into<String>, payload: Bytes, timestamp_ms: i64) {
        self.outputs.push(OutputRecord {
            topic: topic.to_string(),
            key: key.into(),
            payload,
            timestamp_ms,
        });
    }
}

/// Per-partition record handler. Runs on a single task and may own mutable state.
pub trait Processor: Send {
    /// Handles one record. Errors are fatal for the topology instance, so
    /// recoverable problems (a malformed record) must be handled inside.
    fn process(&mut self, ctx: &mut ProcessorContext, record: &Record) -> Result<()>;

    /// Stream-time interval between [`Processor::punctuate`] calls.
    fn punctuation_interval(&self) -> Option<Duration> {
        None
    }

    fn punctuate(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}

/// Drives one processor: stream time, punctuation and output collection.
pub struct PartitionRunner {
    processor: Box<dyn Processor>,
    ctx: ProcessorContext,
    interval_ms: Option<i64>,
    next_punctuation: Option<i64>,
}

impl PartitionRunner {
    pub fn new(partition: u32, processor: Box<dyn Processor>) -> Self {
        let interval_ms = processor
            .punctuation_interval()
            .map(|d| d.as_millis() as i64)
            .filter(|ms| *ms > 0);
        Self {
            processor,
            ctx: ProcessorContext::new(partition),
            interval_ms,
            next_punctuation: None,
        }
    }

    pub fn stream_time(&self) -> i64 {
        self.ctx.stream_time
    }

    pub fn handle(&mut self, record: &Record) -> Result<Vec<OutputRecord>> {
        self.ctx.stream_time = self.ctx.stream_time.max(record.timestamp_ms);
        self.processor.process(&mut self.ctx, record)?;

        if let Some(interval) = self.interval_ms {
            let now = self.ctx.stream_time;
            match self.next_punctuation {
                None => self.next_punctuation = Some(now + interval),
                Some(next) if now >= next => {
                    self.processor.punctuate(&mut self.ctx)?;
                    let skipped = (now - next) / interval + 1;
                    self.next_punctuation = Some(next + skipped * interval);
                }
                Some(_) => {}
            }
        }
        Ok(std::mem::take(&mut self.ctx.outputs))
    }
}

// ============================================================================
// Topology
// ============================================================================

pub type ProcessorFactory = Box<dyn Fn(u32) -> Result<Box<dyn Processor>> + Send + Sync>;

/// A processing graph selected once at construction.
pub enum Topology {
    Enabled {
        name: String,
        source_topic: String,
        sink_topics: Vec<String>,
        stores: Vec<String>,
        factory: ProcessorFactory,
    },
    /// No tasks, no stores, no derived topics.
    Disabled { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyDescription {
    pub name: String,
    pub source_topic: Option<String>,
    pub sink_topics: Vec<String>,
    pub stores: Vec<String>,
}

impl Topology {
    pub fn name(&self) -> &str {
        match self {
            Topology::Enabled { name, .. } | Topology::Disabled { name } => name,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Topology::Enabled { .. })
    }

    pub fn describe(&self) -> TopologyDescription {
        match self {
            Topology::Enabled {
                name,
                source_topic,
                sink_topics,
                stores,
                ..
            } => TopologyDescription {
                name: name.clone(),
                source_topic: Some(source_topic.clone()),
                sink_topics: sink_topics.clone(),
                stores: stores.clone(),
            },
            Topology::Disabled { name } => TopologyDescription {
                name: name.clone(),
                source_topic: None,
                sink_topics: Vec::new(),
                stores: Vec::new(),
            },
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Created,
    /// Replaying partitions up to their end offset at start.
    Restoring,
    Running,
    Failed,
    Closed,
    Disabled,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Created,
            1 => EngineState::Restoring,
            2 => EngineState::Running,
            3 => EngineState::Failed,
            4 => EngineState::Closed,
            _ => EngineState::Disabled,
        }
    }
}

/// Shared, lock-free engine state. Cloned into every partition task and
/// every store view that needs to answer "ready?".
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<AtomicU8>,
    restoring: Arc<AtomicUsize>,
}

impl StateHandle {
    pub fn new(initial: EngineState) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(initial as u8)),
            restoring: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.get() == EngineState::Running
    }

    /// Fails unless stores fed by this engine may be queried.
    pub fn ensure_queryable(&self, store: &str) -> std::result::Result<(), StoreError> {
        match self.get() {
            EngineState::Running => Ok(()),
            EngineState::Disabled => Err(StoreError::Disabled {
                store: store.to_string(),
            }),
            _ => Err(StoreError::NotReady {
                store: store.to_string(),
            }),
        }
    }

    pub(crate) fn set(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn fail(&self) {
        self.set(EngineState::Failed);
    }

    pub(crate) fn begin_restore(&self, partitions: usize) {
        self.restoring.store(partitions, Ordering::SeqCst);
        self.set(if partitions == 0 {
            EngineState::Running
        } else {
            EngineState::Restoring
        });
    }

    fn partition_restored(&self) {
        let remaining = self.restoring.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            // Only promote if nothing failed or closed meanwhile.
            let _ = self.state.compare_exchange(
                EngineState::Restoring as u8,
                EngineState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

/// Runs a topology over the partitions assigned to this node.
pub struct StreamEngine {
    topology: Topology,
    broker: Arc<dyn Broker>,
    producer: Arc<dyn Producer>,
    partitions: Vec<u32>,
    state: StateHandle,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamEngine {
    pub fn new(
        topology: Topology,
        broker: Arc<dyn Broker>,
        producer: Arc<dyn Producer>,
        partitions: Vec<u32>,
    ) -> Self {
        Self::with_state(topology, broker, producer, partitions, StateHandle::new(EngineState::Created))
    }

    /// Builds an engine reporting through `state`, which store views created
    /// before the engine may already hold.
    pub fn with_state(
        topology: Topology,
        broker: Arc<dyn Broker>,
        producer: Arc<dyn Producer>,
        partitions: Vec<u32>,
        state: StateHandle,
    ) -> Self {
        state.set(if topology.is_enabled() {
            EngineState::Created
        } else {
            EngineState::Disabled
        });
        Self {
            topology,
            broker,
            producer,
            partitions,
            state,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.topology.name()
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn partitions(&self) -> &[u32] {
        &self.partitions
    }

    pub fn describe(&self) -> TopologyDescription {
        self.topology.describe()
    }

    /// Spawns one task per assigned partition. Building any partition's
    /// processor or consumer fails the whole engine.
    pub fn start(&self) -> Result<()> {
        let Topology::Enabled {
            name,
            source_topic,
            factory,
            ..
        } = &self.topology
        else {
            info!(topology = self.name(), "Topology disabled, nothing to start");
            return Ok(());
        };
        if self.state.get() != EngineState::Created {
            return Ok(());
        }

        let mut workers = Vec::with_capacity(self.partitions.len());
        for &partition in &self.partitions {
            let built = self
                .broker
                .consumer(source_topic, partition)
                .map_err(Error::from)
                .and_then(|consumer| Ok((consumer, factory(partition)?)));
            match built {
                Ok((consumer, processor)) => {
                    workers.push((consumer, PartitionRunner::new(partition, processor)))
                }
                Err(e) => {
                    self.state.fail();
                    error!(topology = %name, partition, error = %e, "Failed to start partition");
                    return Err(Error::Topology(name.clone(), e.to_string()));
                }
            }
        }

        self.state.begin_restore(workers.len());
        let mut tasks = self.tasks.lock();
        for (consumer, runner) in workers {
            let partition = runner.ctx.partition;
            let worker = tokio::spawn(run_partition(
                name.clone(),
                consumer,
                runner,
                self.producer.clone(),
                self.state.clone(),
                self.cancel.clone(),
            ));
            tasks.push(tokio::spawn(supervise(
                name.clone(),
                partition,
                worker,
                self.state.clone(),
            )));
        }
        info!(topology = %name, partitions = ?self.partitions, "Topology started");
        Ok(())
    }

    /// Stops all partition tasks, waiting at most `timeout` for them to exit.
    pub async fn close(&self, timeout: Duration) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let joined = tokio::time::timeout(timeout, futures::future::join_all(tasks)).await;
        if joined.is_err() {
            warn!(topology = self.name(), "Partition tasks did not stop within {:?}", timeout);
        }
        if self.topology.is_enabled() {
            self.state.set(EngineState::Closed);
        }
    }
}

/// A partition task that panics takes the whole topology down with it.
async fn supervise(topology: String, partition: u32, worker: JoinHandle<()>, state: StateHandle) {
    if let Err(e) = worker.await {
        if e.is_panic() {
            error!(topology = %topology, partition, "Partition task panicked");
            state.fail();
        }
    }
}

async fn run_partition(
    topology: String,
    mut consumer: Box<dyn PartitionConsumer>,
    mut runner: PartitionRunner,
    producer: Arc<dyn Producer>,
    state: StateHandle,
    cancel: CancellationToken,
) {
    let partition = runner.ctx.partition;
    let restore_target = match consumer.end_offset().await {
        Ok(offset) => offset,
        Err(e) => {
            error!(topology = %topology, partition, error = %e, "Failed to read end offset");
            state.fail();
            return;
        }
    };
    let mut restored = consumer.position() >= restore_target;
    if restored {
        state.partition_restored();
    }

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = consumer.poll(MAX_POLL_RECORDS) => polled,
        };
        let records = match polled {
            Ok(records) => records,
            Err(e) => {
                error!(topology = %topology, partition, error = %e, "Poll failed");
                state.fail();
                return;
            }
        };

        for record in &records {
            let outputs = match runner.handle(record) {
                Ok(outputs) => outputs,
                Err(e) => {
                    error!(topology = %topology, partition, offset = record.offset, error = %e, "Processing failed");
                    state.fail();
                    return;
                }
            };
            for out in outputs {
                if let Err(e) = producer
                    .send(&out.topic, &out.key, out.payload, Some(out.timestamp_ms))
                    .await
                {
                    error!(topology = %topology, partition, sink = %out.topic, error = %e, "Forwarding failed");
                    state.fail();
                    return;
                }
            }
        }

        if !restored && consumer.position() >= restore_target {
            restored = true;
            state.partition_restored();
            info!(topology = %topology, partition, offset = restore_target, "Partition restored");
        }
    }
}
