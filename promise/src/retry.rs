//! Retrying a rejected promise.
//!
//! A promise never goes back to `Pending`. Each retry is a fresh promise
//! built from the source's body, scheduled on the source's context with the
//! source's token. A source without a body (already settled, or produced by
//! a combinator) has nothing to re-run, so its first rejection is final.

use super::*;
use crate::promise::{Handoff, Target, guard};

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Runs the body up to `attempts` times in total, until one attempt
    /// resolves.
    ///
    /// Once the attempts are used up the last error is surfaced. Zero
    /// attempts is rejected with [`Error::InvalidInput`].
    pub fn retry(&self, attempts: usize) -> Promise<T> {
        self.retry_if(attempts, |_, _| true)
    }

    /// As [`retry`](Self::retry), consulting `condition` before every new
    /// attempt with the number of attempts left and the latest error.
    /// Returning `false` stops immediately with that error.
    pub fn retry_if<C>(&self, attempts: usize, condition: C) -> Promise<T>
    where
        C: Fn(usize, &Error) -> bool + Send + Sync + 'static,
    {
        self.retry_when(attempts, move |remaining, error| {
            Promise::resolved(condition(remaining, error))
        })
    }

    /// As [`retry_if`](Self::retry_if), but the decision is itself a promise,
    /// e.g. a backoff built with [`delay`](Self::delay).
    ///
    /// A decision that rejects or panics stops retrying with the source's
    /// error; a cancelled decision cancels the result.
    #[cfg_attr(feature = "instrument", tracing::instrument(skip_all, fields(attempts = attempts)))]
    pub fn retry_when<C>(&self, attempts: usize, condition: C) -> Promise<T>
    where
        C: Fn(usize, &Error) -> Promise<bool> + Send + Sync + 'static,
    {
        if attempts == 0 {
            return Promise::rejected(Error::InvalidInput);
        }

        let (next, out) = Promise::pending(self.context().cloned(), self.token().cloned());
        attempt(self.clone(), attempts, Arc::new(condition), out);
        next
    }
}

fn attempt<T, C>(
    mut current: Promise<T>,
    mut remaining: usize,
    condition: Arc<C>,
    out: Resolver<T>,
) where
    T: Clone + Send + Sync + 'static,
    C: Fn(usize, &Error) -> Promise<bool> + Send + Sync + 'static,
{
    loop {
        let handoff = Handoff::new();
        observe(&current, remaining, condition.clone(), out.clone(), handoff.clone());
        match handoff.finish() {
            Some((next, left)) => {
                current = next;
                remaining = left;
            }
            None => return,
        }
    }
}

type Step<T> = (Promise<T>, usize);

fn observe<T, C>(
    current: &Promise<T>,
    remaining: usize,
    condition: Arc<C>,
    out: Resolver<T>,
    handoff: Arc<Handoff<Step<T>>>,
) where
    T: Clone + Send + Sync + 'static,
    C: Fn(usize, &Error) -> Promise<bool> + Send + Sync + 'static,
{
    let source = current.clone();
    current.when_settled(Target::Inline, move |state| {
        let error = match state {
            State::Rejected(error) => error,
            state => {
                out.complete(state);
                return;
            }
        };

        let remaining = remaining - 1;
        if remaining == 0 {
            debug!("Retry attempts exhausted: {error}");
            out.reject(error);
            return;
        }
        if !source.can_rerun() {
            // Observing the same outcome again cannot change it
            debug!("Nothing to retry, the source has no body: {error}");
            out.reject(error);
            return;
        }
        if out.is_cancelled() {
            out.cancel();
            return;
        }

        let decision = guard(|| Ok((*condition)(remaining, &error)))
            .unwrap_or_else(Promise::rejected);
        decision.when_settled(Target::Inline, move |decision| match decision {
            State::Resolved(true) => {
                trace!("Retrying, {remaining} attempts left after a failure: {error}");
                if let Some((next, left)) = handoff.hand_back((source.rerun(), remaining)) {
                    attempt(next, left, condition, out);
                }
            }
            State::Resolved(false) | State::Rejected(_) | State::Pending => {
                debug!("Retry abandoned with {remaining} attempts left");
                out.reject(error);
            }
            State::Cancelled => {
                out.cancel();
            }
        });
    });
}
