//! Aggregation engine: session-windows spans into traces and derives links.

use crate::broker::Record;
use crate::codec::Encoding;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::linker::DependencyLinker;
use crate::metrics::{
    DECODE_FAILURES, DEPENDENCY_LINKS_EMITTED, LATE_SPANS_DROPPED, SPANS_AGGREGATED, TRACES_EMITTED,
};
use crate::model::{normalize_trace_id, Span};
use crate::stream::window::{SessionStore, SessionUpdate};
use crate::stream::{Processor, ProcessorContext, Topology};
use crate::trace::TraceBuilder;
use std::time::Duration;
use tracing::{debug, warn};

pub const TRACE_SESSIONS_STORE: &str = "luma-trace-sessions";

/// Groups the spans of one partition into per-trace session windows.
///
/// Nothing is emitted for a trace until its session closes, that is once
/// stream time passes the session end by more than the inactivity gap.
/// Spans arriving for an already-closed session are dropped.
pub struct AggregationProcessor {
    sessions: SessionStore<TraceBuilder>,
    encoding: Encoding,
    trace_topic: String,
    dependency_topic: String,
}

impl AggregationProcessor {
    pub fn new(gap: Duration, encoding: Encoding, trace_topic: &str, dependency_topic: &str) -> Self {
        Self {
            sessions: SessionStore::new(gap),
            encoding,
            trace_topic: trace_topic.to_string(),
            dependency_topic: dependency_topic.to_string(),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn emit_closed(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let now = ctx.stream_time();
        for (trace_id, session) in self.sessions.drain_closed(now) {
            let spans = session.value.into_spans();
            let payload = self.encoding.encode_spans(&spans).map_err(Error::from)?;
            ctx.forward(&self.trace_topic, trace_id.clone(), payload, session.end);
            TRACES_EMITTED.inc();

            for link in DependencyLinker::new().put_trace(&spans).link() {
                let payload = self.encoding.encode_link(&link)?;
                ctx.forward(&self.dependency_topic, link.key(), payload, session.end);
                DEPENDENCY_LINKS_EMITTED.inc();
            }
            debug!(trace_id = %trace_id, spans = spans.len(), "Emitted trace");
        }
        Ok(())
    }
}

impl Processor for AggregationProcessor {
    fn process(&mut self, ctx: &mut ProcessorContext, record: &Record) -> Result<()> {
        match self.encoding.decode_spans(&record.payload) {
            Ok(spans) => {
                let trace_id = normalize_trace_id(&record.key);
                let now = ctx.stream_time();
                for span in spans {
                    let update = self.sessions.put(
                        &trace_id,
                        record.timestamp_ms,
                        now,
                        TraceBuilder::default,
                        TraceBuilder::join,
                        |mut acc| {
                            acc.add(span);
                            acc
                        },
                    );
                    match update {
                        SessionUpdate::Merged { .. } => SPANS_AGGREGATED.inc(),
                        SessionUpdate::Late { end, .. } => {
                            LATE_SPANS_DROPPED.inc();
                            debug!(trace_id = %trace_id, session_end = end, stream_time = now, "Dropping late span");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(topic = %record.topic, partition = record.partition, offset = record.offset,
                    error = %e, "Skipping undecodable span record");
                DECODE_FAILURES.with_label_values(&[record.topic.as_str()]).inc();
            }
        }
        self.emit_closed(ctx)
    }
}

pub fn topology(config: &StorageConfig) -> Topology {
    let name = "aggregation".to_string();
    if !config.aggregation_enabled {
        return Topology::Disabled { name };
    }

    let gap = config.trace_inactivity_gap();
    let encoding = config.encoding;
    let trace_topic = config.trace_topic.clone();
    let dependency_topic = config.dependency_topic.clone();

    Topology::Enabled {
        name,
        source_topic: config.spans_topic.clone(),
        sink_topics: vec![config.trace_topic.clone(), config.dependency_topic.clone()],
        stores: vec![TRACE_SESSIONS_STORE.to_string()],
        factory: Box::new(move |_partition| {
            Ok(Box::new(AggregationProcessor::new(gap, encoding, &trace_topic, &dependency_topic))
                as Box<dyn Processor>)
        }),
    }
}
