//! Streaming-status polling for the deep-research path.
//!
//! Long-running research turns are observed by polling a status endpoint
//! rather than holding a stream open. The poller supports cooperative
//! cancellation through a watch channel and a hard timeout.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::client::ApiError;

/// Polling cadence and overall deadline.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// How a polling session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The fetch reported a terminal value.
    Ready(T),
    /// The cancel signal fired.
    Cancelled,
    /// The timeout elapsed without a terminal value.
    TimedOut,
}

/// Poll `fetch` until it yields `Some`, the cancel signal fires, or the
/// timeout elapses. `fetch` returning `None` means "still running".
pub async fn poll_until<T, F, Fut>(
    mut fetch: F,
    options: PollOptions,
    mut cancel: watch::Receiver<bool>,
) -> Result<PollOutcome<T>, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ApiError>>,
{
    let deadline = Instant::now() + options.timeout;

    loop {
        if *cancel.borrow() {
            return Ok(PollOutcome::Cancelled);
        }

        if let Some(value) = fetch().await? {
            return Ok(PollOutcome::Ready(value));
        }

        let next_poll = Instant::now() + options.interval;
        if next_poll >= deadline {
            debug!("Status polling timed out");
            return Ok(PollOutcome::TimedOut);
        }

        tokio::select! {
            _ = sleep_until(next_poll) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Ok(PollOutcome::Cancelled);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
