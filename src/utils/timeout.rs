//! Timeout helpers
//!
//! Nothing in the messaging core cancels a call on its own. Callers that need a
//! bounded wait wrap the operation with these helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default timeout for connecting and logging in
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the client login conversation
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for graceful shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a new client waits for the hub's endpoint table
pub const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a future with a timeout, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => {
            debug!(timeout_ms = duration.as_millis() as u64, "Operation timed out");
            Err(ProtocolError::Timeout)
        }
    }
}

/// Run a blocking closure on a helper thread and give up waiting after `duration`.
///
/// Intended for layering a deadline over `Invoker::invoke_and_wait`. The closure keeps
/// running after the deadline; only the wait is abandoned.
pub fn blocking_with_timeout<F, T>(f: F, duration: Duration) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    std::thread::Builder::new()
        .name("nodewire-deadline".into())
        .spawn(move || {
            let _ = tx.send(f());
        })?;

    match rx.recv_timeout(duration) {
        Ok(result) => result,
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(ProtocolError::Timeout),
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(ProtocolError::Custom(
            crate::error::constants::ERR_REPLY_DROPPED.into(),
        )),
    }
}
