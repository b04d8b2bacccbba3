//! Cancellable pauses.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleeps for `duration` unless `shutdown` fires first.
///
/// Returns `false` when the pause was cut short by shutdown.
pub async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
