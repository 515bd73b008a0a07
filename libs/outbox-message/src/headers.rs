//! Recognised envelope header keys (spec §3 data model).

pub const AGGREGATE_ROOT_ID: &str = "aggregate_root_id";
pub const AGGREGATE_ROOT_VERSION: &str = "aggregate_root_version";
pub const EVENT_ID: &str = "event_id";
pub const TIME_OF_RECORDING: &str = "time_of_recording";
pub const TIME_OF_RECORDING_MS: &str = "time_of_recording_ms";
pub const SCHEMA_VERSION: &str = "schema_version";
pub const ATTEMPT: &str = "attempt";
pub const DELAY_UNTIL: &str = "delay_until";
pub const STREAM_OFFSET: &str = "stream_offset";
pub const TENANT_ID: &str = "tenant_id";

/// Added by an outbox repository to every message yielded from
/// `retrieve_batch`, identifying where it came from.
pub const OUTBOX_ID: &str = "outbox_id";
pub const OUTBOX_TABLE: &str = "outbox_table";
pub const OUTBOX_CONSUMED: &str = "outbox_consumed";

/// Added by the throttled outbox repository to distinguish which of its
/// two read-eligible phases a retrieved row came from: `"initial"` (the
/// burst publication) or `"delayed"` (the post-window publication), so
/// `markConsumed` knows which of `consumed_initially`/`consumed_delayed`
/// to set.
pub const OUTBOX_THROTTLE_PHASE: &str = "outbox_throttle_phase";

/// Added by the AMQP inbound relay to every delivery it hands to a worker.
pub const AMQP_QUEUE_NAME: &str = "amqp_queue_name";
