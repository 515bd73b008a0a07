use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Per-stream outbox metrics. `pending` must be refreshed by the caller
/// (e.g. a relay runner's poll tick) from
/// [`OutboxRepository::number_of_pending_messages`]; `published` is
/// incremented by [`crate::relay::OutboxRelay`] as runs are dispatched.
///
/// [`OutboxRepository::number_of_pending_messages`]: crate::repository::OutboxRepository::number_of_pending_messages
#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub published: IntCounter,
    pub oldest_pending_age_seconds: prometheus::Gauge,
}

impl OutboxMetrics {
    pub fn new(stream: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = IntGauge::with_opts(
            Opts::new(
                "outbox_pending_count",
                "Number of unpublished outbox rows currently pending",
            )
            .const_label("stream", stream.to_string()),
        )
        .expect("valid metric opts for outbox_pending_count");

        let published = IntCounter::with_opts(
            Opts::new(
                "outbox_published_total",
                "Total number of outbox rows dispatched and marked consumed",
            )
            .const_label("stream", stream.to_string()),
        )
        .expect("valid metric opts for outbox_published_total");

        let oldest_pending_age_seconds = prometheus::Gauge::with_opts(
            Opts::new(
                "outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest pending outbox row",
            )
            .const_label("stream", stream.to_string()),
        )
        .expect("valid metric opts for outbox_oldest_pending_age_seconds");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(published.clone()),
            Box::new(oldest_pending_age_seconds.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self { pending, published, oldest_pending_age_seconds }
    }
}
