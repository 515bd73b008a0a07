//! Transactional outbox core.
//!
//! A business transaction writes its domain rows and its outgoing
//! messages to the same table set, in the same commit, so the two can
//! never diverge. Three repository shapes cover how those rows become
//! retrievable:
//!
//! - [`PlainOutboxRepository`] — `consumed = false`, no extra semantics.
//! - [`DelayedOutboxRepository`] — a pluggable [`BackoffStrategy`] stamps a
//!   `delay_until` on write; rows are only retrievable once it elapses.
//! - [`ThrottledOutboxRepository`] — collapses bursts sharing an
//!   idempotency key into at most one publication per rolling window.
//!
//! [`NotifyingOutboxRepository`] wraps any of the three to emit a Postgres
//! `NOTIFY` inside the same write transaction, so a relay runner waiting on
//! `LISTEN` wakes as soon as rows are visible instead of only on its poll
//! timer. [`OutboxRelay`] is the pull side: given a repository and a
//! downstream `outbox_message::Dispatcher`, it retrieves a batch,
//! dispatches it in commit-sized runs, and marks each run consumed only
//! once it has gone out.
//!
//! None of these types decide *when* to run — that's a relay runner's job,
//! one layer up.

mod delayed;
mod error;
mod metrics;
mod notify;
mod plain;
mod relay;
mod repository;
mod throttled;

pub use delayed::DelayedOutboxRepository;
pub use error::{OutboxError, OutboxResult};
pub use metrics::OutboxMetrics;
pub use notify::{NotifyStyle, NotifyingOutboxOptions, NotifyingOutboxRepository};
pub use plain::PlainOutboxRepository;
pub use relay::OutboxRelay;
pub use repository::{BackoffStrategy, Clock, LinearBackoff, OutboxRepository, SystemClock};
pub use throttled::{KeyResolver, ThrottledOutboxRepository};
