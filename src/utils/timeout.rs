//! Timeout and cancellation helpers.
//!
//! Every suspension point in the engine is raced against either a deadline or
//! the shared [`CancellationToken`], usually both. These wrappers keep that
//! pattern in one place.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};

/// Grace period a server-mode listener gives outstanding units after a stop
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(2500);

/// Backoff between ACK / size-indicator retries
pub const RETRY_DELAY: Duration = Duration::from_millis(25);

/// Default short read timeout used by the receive tolerance loop
pub const TOLERANCE_DELAY: Duration = Duration::from_millis(25);

/// Run a future with a timeout, mapping expiry to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Run a future bounded by both a timeout and a cancellation token.
///
/// Cancellation wins ties so that a stopping engine never starts new work.
pub async fn guarded<F, T>(fut: F, duration: Duration, cancel: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
        result = with_timeout_error(fut, duration) => result,
    }
}

/// Sleep for `duration` unless cancelled first.
///
/// Returns `false` if the token fired.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
