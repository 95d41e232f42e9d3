//! Bounded waits for blocking calls
//!
//! `run_bounded` moves a blocking call onto a named helper thread and waits
//! for its result with a deadline. On timeout only the local wait is
//! abandoned; the helper keeps running until its own call returns.
//! [`ClusterContext::run_bounded`](super::ClusterContext::run_bounded) also
//! cancels the helper's pending exchanges.

use crate::error::{ForgeResult, RingForgeError};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a bounded wait
#[derive(Debug)]
pub enum WatchdogOutcome<T> {
    Completed(T),
    TimedOut { label: String, waited: Duration },
}

impl<T> WatchdogOutcome<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, WatchdogOutcome::TimedOut { .. })
    }

    /// Map a timeout to [`RingForgeError::CollectiveTimeout`] for `rank`
    pub fn into_result(self, rank: usize) -> ForgeResult<T> {
        match self {
            WatchdogOutcome::Completed(value) => Ok(value),
            WatchdogOutcome::TimedOut { label, waited } => Err(RingForgeError::CollectiveTimeout {
                op: label,
                rank,
                waited,
            }),
        }
    }
}

/// Run `f` on a helper thread and wait at most `timeout` for it.
///
/// A panic inside `f` is reported as an internal error rather than a timeout.
pub fn run_bounded<T, F>(label: &str, timeout: Duration, f: F) -> ForgeResult<WatchdogOutcome<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name(format!("watchdog:{}", label))
        .spawn(move || {
            // receiver may be gone after a timeout
            let _ = tx.send(f());
        })
        .map_err(|e| RingForgeError::InternalError(format!("spawn {} helper: {}", label, e)))?;

    let start = Instant::now();
    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(WatchdogOutcome::Completed(value)),
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(label, waited_ms = start.elapsed().as_millis() as u64, "bounded wait expired");
            Ok(WatchdogOutcome::TimedOut {
                label: label.to_string(),
                waited: timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(RingForgeError::InternalError(format!(
            "{} panicked before producing a result",
            label
        ))),
    }
}
