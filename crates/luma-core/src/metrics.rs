use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

lazy_static::lazy_static! {
    pub static ref SPANS_ACCEPTED: IntCounter = register_int_counter!(
        "luma_trace_spans_accepted_total",
        "Spans accepted by the span consumer"
    ).unwrap();

    pub static ref SPANS_AGGREGATED: IntCounter = register_int_counter!(
        "luma_trace_spans_aggregated_total",
        "Spans folded into a session window"
    ).unwrap();

    pub static ref LATE_SPANS_DROPPED: IntCounter = register_int_counter!(
        "luma_trace_late_spans_dropped_total",
        "Spans dropped because their session window had already closed"
    ).unwrap();

    pub static ref TRACES_EMITTED: IntCounter = register_int_counter!(
        "luma_trace_traces_emitted_total",
        "Traces emitted by the aggregation engine"
    ).unwrap();

    pub static ref DEPENDENCY_LINKS_EMITTED: IntCounter = register_int_counter!(
        "luma_trace_dependency_links_emitted_total",
        "Dependency links emitted by the aggregation engine"
    ).unwrap();

    pub static ref DECODE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "luma_trace_decode_failures_total",
        "Records skipped because they could not be decoded",
        &["topic"]
    ).unwrap();

    pub static ref STORE_WRITES: IntCounterVec = register_int_counter_vec!(
        "luma_trace_store_writes_total",
        "Records written to local stores",
        &["store"]
    ).unwrap();

    pub static ref TRACES_EVICTED: IntCounter = register_int_counter!(
        "luma_trace_traces_evicted_total",
        "Traces deleted by the retention sweep"
    ).unwrap();

    pub static ref QUERY_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "luma_trace_query_duration_seconds",
        "Local store query latency distribution",
        &["store", "query"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    ).unwrap();

    pub static ref SCATTER_GATHER_QUERIES: IntCounterVec = register_int_counter_vec!(
        "luma_trace_scatter_gather_queries_total",
        "Coordinated queries by outcome (full, degraded, failed)",
        &["store", "outcome"]
    ).unwrap();
}
