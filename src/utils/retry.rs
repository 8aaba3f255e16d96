//! Backoff builders.
//!
//! Uses `backon` for exponential backoff. The receive loop pulls delays from
//! the iterator directly so the pause stays cancellable.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between failed receive attempts in a consumer loop.
///
/// - First delay: 1s
/// - Max delay: 30s
/// - Unbounded attempts (the loop only stops on cancellation)
pub fn receive_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
}

/// Backoff for establishing broker connections at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
