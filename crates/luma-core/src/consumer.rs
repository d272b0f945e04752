//! Ingestion boundary: publishes accepted spans to the spans topic.

use crate::broker::Producer;
use crate::codec::Encoding;
use crate::error::{Error, Result};
use crate::metrics::SPANS_ACCEPTED;
use crate::model::{normalize_trace_id, Span};
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::debug;

/// Either publishes spans or, when span consumption is disabled, drops them.
#[derive(Clone)]
pub enum SpanConsumer {
    Enabled {
        producer: Arc<dyn Producer>,
        topic: String,
        encoding: Encoding,
    },
    Noop,
}

impl SpanConsumer {
    pub fn new(producer: Arc<dyn Producer>, topic: impl Into<String>, encoding: Encoding) -> Self {
        SpanConsumer::Enabled {
            producer,
            topic: topic.into(),
            encoding,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, SpanConsumer::Enabled { .. })
    }

    /// Publishes one record per trace, keyed by trace ID, with spans kept in
    /// arrival order. Resolves once every record is acknowledged and fails
    /// if any send fails.
    pub fn accept(&self, spans: Vec<Span>) -> BoxFuture<'static, Result<()>> {
        let SpanConsumer::Enabled {
            producer,
            topic,
            encoding,
        } = self
        else {
            return future::ready(Ok(())).boxed();
        };
        if spans.is_empty() {
            return future::ready(Ok(())).boxed();
        }

        let count = spans.len();
        let groups = group_by_trace(spans);
        let mut payloads = Vec::with_capacity(groups.len());
        for (trace_id, group) in groups {
            match encoding.encode_spans(&group) {
                Ok(payload) => payloads.push((trace_id, payload)),
                Err(e) => return future::ready(Err(e.into())).boxed(),
            }
        }

        let producer = producer.clone();
        let topic = topic.clone();
        async move {
            let sends = payloads
                .into_iter()
                .map(|(trace_id, payload)| {
                    let producer = producer.clone();
                    let topic = topic.clone();
                    async move { producer.send(&topic, &trace_id, payload, None).await }
                });
            for sent in future::join_all(sends).await {
                sent?;
            }
            SPANS_ACCEPTED.inc_by(count as u64);
            debug!(spans = count, topic = %topic, "Accepted spans");
            Ok::<(), Error>(())
        }
        .boxed()
    }
}

/// Groups spans by normalized trace ID, in order of first appearance.
fn group_by_trace(spans: Vec<Span>) -> Vec<(String, Vec<Span>)> {
    let mut groups: Vec<(String, Vec<Span>)> = Vec::new();
    for span in spans {
        let trace_id = normalize_trace_id(&span.trace_id);
        match groups.iter_mut().find(|(id, _)| *id == trace_id) {
            Some((_, group)) => group.push(span),
            None => groups.push((trace_id, vec![span])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker, PartitionConsumer, TopicSpec};

    #[test]
    fn test_group_by_trace_keeps_order() {
        let groups = group_by_trace(vec![
            Span::new("b", "1"),
            Span::new("a", "2"),
            Span::new("B", "3"),
        ]);
        let keys: Vec<&str> = groups.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_accept_publishes_one_record_per_trace() {
        let broker = MemoryBroker::new(format!("consumer-{}", uuid::Uuid::new_v4()));
        broker
            .admin()
            .unwrap()
            .create_topics(&[TopicSpec::new("zipkin-spans", 1)])
            .await
            .unwrap();
        let consumer = SpanConsumer::new(broker.producer().unwrap(), "zipkin-spans", Encoding::Json);

        consumer
            .accept(vec![Span::new("a", "1"), Span::new("b", "2"), Span::new("a", "3")])
            .await
            .unwrap();

        let mut partition = broker.consumer("zipkin-spans", 0).unwrap();
        let records = partition.poll(10).await.unwrap();
        assert_eq!(records.len(), 2);
        let first = Encoding::Json.decode_spans(&records[0].payload).unwrap();
        assert_eq!(records[0].key, "a");
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_accept_fails_when_topic_is_missing() {
        let broker = MemoryBroker::new(format!("consumer-{}", uuid::Uuid::new_v4()));
        let consumer = SpanConsumer::new(broker.producer().unwrap(), "absent", Encoding::Json);
        assert!(consumer.accept(vec![Span::new("a", "1")]).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_and_noop_accept() {
        let broker = MemoryBroker::new(format!("consumer-{}", uuid::Uuid::new_v4()));
        let consumer = SpanConsumer::new(broker.producer().unwrap(), "absent", Encoding::Json);
        assert!(consumer.accept(Vec::new()).await.is_ok());
        assert!(SpanConsumer::Noop.accept(vec![Span::new("a", "1")]).await.is_ok());
    }
}
