//! Prometheus metrics for a relay runner's own lifecycle, distinct from
//! [`transactional_outbox::OutboxMetrics`]'s per-stream pending/published
//! counters: this tracks how the runner itself is behaving, not the
//! outbox table it drains.

use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct RunnerMetrics {
    pub batches_total: IntCounter,
    pub leader_gauge: IntGauge,
}

impl RunnerMetrics {
    pub fn new(runner: &str) -> Self {
        let registry = prometheus::default_registry();

        let batches_total = IntCounter::with_opts(
            Opts::new(
                "outbox_runner_batches_total",
                "Total number of relay batches this runner has dispatched",
            )
            .const_label("runner", runner.to_string()),
        )
        .expect("valid metric opts for outbox_runner_batches_total");

        let leader_gauge = IntGauge::with_opts(
            Opts::new(
                "outbox_runner_leader_gauge",
                "1 while this process holds the runner's leader lock, 0 otherwise",
            )
            .const_label("runner", runner.to_string()),
        )
        .expect("valid metric opts for outbox_runner_leader_gauge");

        for metric in [
            Box::new(batches_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(leader_gauge.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox runner metric: {}", e);
            }
        }

        Self { batches_total, leader_gauge }
    }
}
