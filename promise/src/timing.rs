//! Timer-based combinators.
//!
//! Both rely on [`Context::dispatch_after`], so no thread ever sleeps on a
//! promise's behalf.

use super::*;
use crate::promise::Target;

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Resolves with the same value, `delay` after this promise resolves.
    ///
    /// The value is delivered on `context`. Rejection and cancellation pass
    /// through immediately.
    pub fn delay(&self, context: &Context, delay: time::Duration) -> Promise<T> {
        let (next, out) = Promise::pending(Some(context.clone()), self.token().cloned());
        let o = out.clone();
        let ctx = context.clone();
        self.when_resolved(Target::Inline, move |value| {
            ctx.dispatch_after(delay, move || {
                o.resolve(value);
            })
        });
        self.forward_failure(out);
        next
    }

    /// Races this promise against a timer.
    ///
    /// If `interval` elapses first the result rejects with `error`, or
    /// [`Error::Timeout`] when none is given. The source keeps running; only
    /// its late outcome is ignored.
    pub fn timeout(
        &self,
        context: &Context,
        interval: time::Duration,
        error: Option<Error>,
    ) -> Promise<T> {
        let (next, out) = Promise::pending(Some(context.clone()), self.token().cloned());
        self.forward_to(out.clone());
        context.dispatch_after(interval, move || {
            if out.reject(error.unwrap_or(Error::Timeout)) {
                debug!("Promise timed out after {interval}");
            }
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::Manual;

    #[test]
    fn delay_defers_resolution() {
        let exec = Arc::new(Manual::default());
        let ctx = Context::concurrent("manual", exec.clone());
        let p = Promise::resolved(5).delay(&ctx, time::Duration::milliseconds(300));
        assert!(p.is_pending());

        {
            let jobs = exec.jobs.lock().unwrap();
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].0, time::Duration::milliseconds(300));
        }
        exec.run_all();
        assert_eq!(p.value(), Some(5));
    }

    #[test]
    fn delay_passes_rejection_straight_through() {
        let exec = Arc::new(Manual::default());
        let ctx = Context::concurrent("manual", exec.clone());
        let p = Promise::<i32>::rejected(Error::InvalidInput).delay(&ctx, time::Duration::hours(1));
        assert!(matches!(p.error(), Some(Error::InvalidInput)));
        assert_eq!(exec.run_all(), 0);
    }

    #[test]
    fn timeout_loses_to_source() {
        let exec = Arc::new(Manual::default());
        let ctx = Context::concurrent("manual", exec.clone());
        let (src, r) = Promise::pending(None, None);
        let p = src.timeout(&ctx, time::Duration::seconds(1), None);

        r.resolve(1);
        assert_eq!(p.value(), Some(1));

        // Timer fires later and is ignored
        exec.run_all();
        assert_eq!(p.value(), Some(1));
    }

    #[test]
    fn timeout_wins_over_source() {
        let exec = Arc::new(Manual::default());
        let ctx = Context::concurrent("manual", exec.clone());
        let (src, r) = Promise::<i32>::pending(None, None);
        let p = src.timeout(&ctx, time::Duration::seconds(1), None);
        let q = src.timeout(&ctx, time::Duration::seconds(1), Some(Error::other("custom")));

        exec.run_all();
        assert!(matches!(p.error(), Some(Error::Timeout)));
        assert_eq!(q.error().map(|e| e.to_string()).as_deref(), Some("custom"));

        // Source is not cancelled, it simply no longer matters
        r.resolve(3);
        assert_eq!(src.value(), Some(3));
        assert!(matches!(p.error(), Some(Error::Timeout)));
    }
}
