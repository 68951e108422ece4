//! Backoff builders for the store and the change-feed tailer.
//!
//! Uses `backon`. Tail reconnects wait a fixed interval; transaction retries
//! back off exponentially with jitter and give up after a few attempts.

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder};

/// Backoff between change-stream reconnect attempts.
///
/// Constant delay, no attempt limit: a tailer keeps trying until cancelled.
pub fn tail_backoff(interval: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(interval)
        .without_max_times()
}

/// Backoff for retrying a whole transaction after a transient driver error.
///
/// - Min delay: 5ms
/// - Max delay: 500ms
/// - Max attempts: 5
/// - Jitter enabled
pub fn transaction_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(5)
        .with_jitter()
}
