//! Blocking bridge from a promise back to synchronous code.
//!
//! The calling thread parks on a one-shot channel that the promise's settle
//! observer fills exactly once. Waiting from inside the serial context the
//! promise runs on would never return, and neither would waiting on a
//! combinator whose inputs are queued on the blocked serial context. Both are
//! refused with [`Error::InvalidContext`]: a job on a serial context may only
//! wait for promises that have already settled.

use super::*;
use crate::promise::Target;

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Blocks the calling thread until the promise settles.
    ///
    /// Returns the value, or the rejection error. A cancelled promise yields
    /// [`Error::Cancelled`].
    ///
    /// Called from a job on a serial context, waiting for a promise that is
    /// still pending fails with [`Error::InvalidContext`].
    pub fn wait(&self) -> Result<T> {
        self.block(None)
    }

    /// As [`wait`](Self::wait), discarding any error.
    pub fn wait_value(&self) -> Option<T> {
        self.wait().ok()
    }

    /// As [`wait`](Self::wait), but gives up with [`Error::Timeout`] after
    /// `timeout`. The promise itself is unaffected.
    pub fn wait_timeout(&self, timeout: time::Duration) -> Result<T> {
        self.block(Some(timeout))
    }

    fn block(&self, timeout: Option<time::Duration>) -> Result<T> {
        if let Some(context) = self.context().filter(|c| c.is_serial() && c.is_current()) {
            warn!(
                "Refusing to wait for a promise on its own serial context '{}'",
                context.label()
            );
            return Err(Error::InvalidContext);
        }
        if self.is_pending() && context::on_serial() {
            // The promise may well depend on work queued behind this job
            warn!("Refusing to block a serial context on a pending promise");
            return Err(Error::InvalidContext);
        }

        let (tx, rx) = flume::bounded(1);
        self.when_settled(Target::Inline, move |state| {
            // The receiver may have timed out and gone
            _ = tx.send(state);
        });

        let state = match timeout {
            None => rx.recv().map_err(|_| Error::Cancelled)?,
            Some(timeout) => {
                let timeout = std::time::Duration::try_from(timeout).unwrap_or_default();
                match rx.recv_timeout(timeout) {
                    Ok(state) => state,
                    Err(flume::RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                    Err(flume::RecvTimeoutError::Disconnected) => return Err(Error::Cancelled),
                }
            }
        };

        match state {
            State::Resolved(value) => Ok(value),
            State::Rejected(error) => Err(error),
            State::Cancelled | State::Pending => Err(Error::Cancelled),
        }
    }
}
