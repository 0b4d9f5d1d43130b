//! Timeouts and cooperative cancellation for long-running pipeline work.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};

use crate::error::{Error, Result};

/// Run `f` on a worker thread and wait at most `after` for its result.
///
/// On timeout the worker is detached and left to finish on its own; its
/// result is discarded.
pub fn run_with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    f: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("docrag-{operation}"))
        .spawn(move || {
            let _ = tx.send(f());
        })?;

    match rx.recv_timeout(after) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(operation, ?after, "operation timed out");
            Err(Error::Timeout { operation, after })
        }
        Err(RecvTimeoutError::Disconnected) => Err(Error::Model(format!(
            "{operation} worker exited without a result"
        ))),
    }
}

/// Shared flag checked between batches of work.
///
/// Cancelling never interrupts a batch already in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
