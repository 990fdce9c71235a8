//! Pipeline-level observability metrics (SPEC_FULL.md §10.1) that the `libs`
//! crates don't already own: per-queue depth, oracle latency/concurrency,
//! and reconciliation throughput. Outbox pending/age and circuit breaker
//! state transitions are already emitted by `outbox::metrics` and
//! `resilience::metrics` respectively.

use once_cell::sync::Lazy;
use prometheus::{register_histogram_vec, register_int_gauge_vec, HistogramVec, IntGaugeVec};

static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pipeline_queue_depth",
        "Number of jobs waiting on a named queue",
        &["queue"]
    )
    .expect("failed to register pipeline_queue_depth")
});

static ORACLE_CALL_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "pipeline_oracle_call_duration_seconds",
        "Oracle call latency by calling worker",
        &["worker"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("failed to register pipeline_oracle_call_duration_seconds")
});

static ORACLE_IN_FLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pipeline_oracle_in_flight",
        "Oracle calls currently awaiting a response",
        &["worker"]
    )
    .expect("failed to register pipeline_oracle_in_flight")
});

static RECONCILIATION_THROUGHPUT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pipeline_reconciliation_decisions_total",
        "Reconciliation outcomes by decision",
        &["decision"]
    )
    .expect("failed to register pipeline_reconciliation_decisions_total")
});

pub fn set_queue_depth(queue: &str, depth: i64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

pub fn observe_oracle_call(worker: &str, seconds: f64) {
    ORACLE_CALL_LATENCY.with_label_values(&[worker]).observe(seconds);
}

pub fn oracle_call_started(worker: &str) {
    ORACLE_IN_FLIGHT.with_label_values(&[worker]).inc();
}

pub fn oracle_call_finished(worker: &str) {
    ORACLE_IN_FLIGHT.with_label_values(&[worker]).dec();
}

pub fn record_reconciliation_decision(accepted: bool) {
    let decision = if accepted { "accepted" } else { "rejected" };
    RECONCILIATION_THROUGHPUT.with_label_values(&[decision]).inc();
}
