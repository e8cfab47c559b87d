//! Coordinator metric groups registered on the global OpenTelemetry meter.
//!
//! Instruments are no-ops unless [`crate::init_metrics`] ran before their
//! first use.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct SessionMetrics {
    pub joins_total: Counter<u64>,
    pub joins_rejected_total: Counter<u64>,
    pub evictions_total: Counter<u64>,
    pub session_resets_total: Counter<u64>,
}

pub struct RoundMetrics {
    pub weights_received_total: Counter<u64>,
    pub weights_rejected_total: Counter<u64>,
    pub metrics_received_total: Counter<u64>,
    pub rounds_total: Counter<u64>,
    pub round_failures_total: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
}

pub struct CoordinatorMetrics {
    pub session: SessionMetrics,
    pub round: RoundMetrics,
}

static FL_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("treefed_coordinator"));

pub static COORDINATOR_METRICS: Lazy<CoordinatorMetrics> = Lazy::new(|| CoordinatorMetrics {
    session: SessionMetrics {
        joins_total: FL_METER.u64_counter("treefed_joins_total").with_description("Accepted client joins").build(),
        joins_rejected_total: FL_METER.u64_counter("treefed_joins_rejected_total").with_description("Joins rejected because the session was full").build(),
        evictions_total: FL_METER.u64_counter("treefed_evictions_total").with_description("Registrations evicted for inactivity").build(),
        session_resets_total: FL_METER.u64_counter("treefed_session_resets_total").with_description("Full session resets").build(),
    },
    round: RoundMetrics {
        weights_received_total: FL_METER.u64_counter("treefed_weights_received_total").with_description("Weight payloads stored").build(),
        weights_rejected_total: FL_METER.u64_counter("treefed_weights_rejected_total").with_description("Weight payloads rejected (stale session or malformed)").build(),
        metrics_received_total: FL_METER.u64_counter("treefed_metrics_received_total").with_description("Evaluation metric reports received").build(),
        rounds_total: FL_METER.u64_counter("treefed_rounds_total").with_description("Global model rounds committed").build(),
        round_failures_total: FL_METER.u64_counter("treefed_round_failures_total").with_description("Global model requests that ended without a model").build(),
        aggregation_latency_ms: FL_METER
            .f64_histogram("treefed_aggregation_latency_ms")
            .with_description("Aggregate, blend and persist latency ms")
            .with_unit("ms")
            .build(),
    },
});

pub fn coordinator_metrics() -> &'static CoordinatorMetrics { &COORDINATOR_METRICS }
