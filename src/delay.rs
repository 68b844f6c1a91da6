//! A network-latency simulator.
//!
//! Mock loaders wrap their canned responses in [`delayed`] to emulate slow
//! network conditions, which is what makes the pending state of a
//! [`Resource`](crate::Resource) observable in demos and tests at all.

use std::future::Future;
use std::time::Duration;

/// Resolves after the given duration.
pub async fn delay(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Returns a future resolving to `value` after the given duration.
pub fn delayed<T>(duration: Duration, value: T) -> impl Future<Output = T> {
    async move {
        delay(duration).await;
        value
    }
}
