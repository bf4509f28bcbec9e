//! Sequencing combinators.
//!
//! Every combinator returns a new promise and leaves its source untouched.
//! Handlers run on the context they are given; plumbing that merely passes
//! an outcome along runs inline on the settling thread. A cancelled source
//! yields a cancelled result without invoking any handler, except for
//! [`always`](Promise::always) and [`cancelled`](Promise::cancelled).

use super::*;
use crate::promise::{Target, guard};

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// A pending result sharing this promise's token.
    fn follow<U>(&self, target: &Target) -> (Promise<U>, Resolver<U>)
    where
        U: Clone + Send + Sync + 'static,
    {
        let context = match target {
            Target::On(ctx) => Some(ctx.clone()),
            Target::Inline => None,
        };
        Promise::pending(context, self.token().cloned())
    }

    pub(crate) fn then_on<U, F>(&self, target: Target, f: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let (next, out) = self.follow(&target);
        let o = out.clone();
        self.when_resolved(target, move |value| match guard(|| f(value)) {
            Ok(v) => {
                o.resolve(v);
            }
            Err(e) => {
                o.reject(e);
            }
        });
        self.forward_failure(out);
        next
    }

    pub(crate) fn and_then_on<U, F>(&self, target: Target, f: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let (next, out) = self.follow(&target);
        let o = out.clone();
        self.when_resolved(target, move |value| match guard(|| Ok(f(value))) {
            Ok(p) => p.forward_to(o),
            Err(e) => {
                o.reject(e);
            }
        });
        self.forward_failure(out);
        next
    }

    /// Transforms the resolved value on `context`.
    ///
    /// Rejections skip `f` and pass straight through. An `Err` returned by
    /// `f`, or a panic inside it, rejects the result.
    pub fn then<U, F>(&self, context: &Context, f: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.then_on(Target::On(context.clone()), f)
    }

    /// Chains another promise: the result adopts whatever `f` returns.
    pub fn and_then<U, F>(&self, context: &Context, f: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.and_then_on(Target::On(context.clone()), f)
    }

    /// Handles a rejection on `context`.
    ///
    /// The returned promise resolves once the chain resolves or `f` returns
    /// `Ok`, and rejects if `f` fails.
    pub fn catch<F>(&self, context: &Context, f: F) -> Promise<()>
    where
        F: FnOnce(Error) -> Result<()> + Send + 'static,
    {
        let (next, out) = self.follow(&Target::On(context.clone()));
        let o = out.clone();
        self.when_resolved(Target::Inline, move |_| {
            o.resolve(());
        });
        let o = out.clone();
        self.when_rejected(Target::On(context.clone()), move |error| {
            match guard(|| f(error)) {
                Ok(()) => o.resolve(()),
                Err(e) => o.reject(e),
            };
        });
        self.when_cancelled(Target::Inline, move || {
            out.cancel();
        });
        next
    }

    /// Replaces a rejection with the promise returned by `f`.
    pub fn recover<F>(&self, context: &Context, f: F) -> Promise<T>
    where
        F: FnOnce(Error) -> Promise<T> + Send + 'static,
    {
        let (next, out) = self.follow(&Target::On(context.clone()));
        let o = out.clone();
        self.when_resolved(Target::Inline, move |v| {
            o.resolve(v);
        });
        let o = out.clone();
        self.when_rejected(Target::On(context.clone()), move |error| {
            match guard(|| Ok(f(error))) {
                Ok(p) => p.forward_to(o),
                Err(e) => {
                    o.reject(e);
                }
            }
        });
        self.when_cancelled(Target::Inline, move || {
            out.cancel();
        });
        next
    }

    /// Rejects with [`Error::PredicateRejected`] unless `predicate` holds.
    pub fn ensure<F>(&self, context: &Context, predicate: F) -> Promise<T>
    where
        F: FnOnce(&T) -> bool + Send + 'static,
    {
        self.then(context, move |v| {
            if predicate(&v) {
                Ok(v)
            } else {
                Err(Error::PredicateRejected)
            }
        })
    }

    /// Alias of [`ensure`](Self::ensure).
    pub fn validate<F>(&self, context: &Context, predicate: F) -> Promise<T>
    where
        F: FnOnce(&T) -> bool + Send + 'static,
    {
        self.ensure(context, predicate)
    }

    /// Runs `f` whatever the outcome, then passes the outcome on.
    ///
    /// If `f` fails its error replaces a resolution or rejection. A cancelled
    /// chain stays cancelled.
    pub fn always<F>(&self, context: &Context, f: F) -> Promise<T>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (next, out) = self.follow(&Target::On(context.clone()));
        self.when_settled(Target::On(context.clone()), move |state| {
            match (guard(f), state) {
                (_, State::Cancelled) => out.cancel(),
                (Ok(()), state) => out.complete(state),
                (Err(e), _) => out.reject(e),
            };
        });
        next
    }

    /// Runs a side effect on the value without changing it.
    ///
    /// A failing `f` rejects the chain.
    pub fn forward<F>(&self, context: &Context, f: F) -> Promise<T>
    where
        F: FnOnce(&T) -> Result<()> + Send + 'static,
    {
        self.then(context, move |v| {
            f(&v)?;
            Ok(v)
        })
    }

    /// Like [`forward`](Self::forward), but waits for the promise `f` returns
    /// before passing the original value on.
    pub fn pass<U, F>(&self, context: &Context, f: F) -> Promise<T>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> Promise<U> + Send + 'static,
    {
        self.and_then(context, move |v| {
            let side = f(&v);
            side.then_on(Target::Inline, move |_| Ok(v))
        })
    }

    /// Discards the value.
    pub fn void(&self) -> Promise<()> {
        self.then_on(Target::Inline, |_| Ok(()))
    }

    /// Runs `f` on `context` only if the chain is cancelled.
    ///
    /// The outcome itself passes through unchanged.
    pub fn cancelled<F>(&self, context: &Context, f: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let (next, out) = self.follow(&Target::On(context.clone()));
        let o = out.clone();
        self.when_resolved(Target::Inline, move |v| {
            o.resolve(v);
        });
        let o = out.clone();
        self.when_rejected(Target::Inline, move |e| {
            o.reject(e);
        });
        self.when_cancelled(Target::On(context.clone()), move || {
            if let Err(e) = guard(|| {
                f();
                Ok(())
            }) {
                debug!("Cancellation handler failed: {e}");
            }
            out.cancel();
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::Manual;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn manual() -> (Arc<Manual>, Context) {
        let exec = Arc::new(Manual::default());
        let ctx = Context::concurrent("manual", exec.clone());
        (exec, ctx)
    }

    #[test]
    fn then_identity() {
        let (exec, ctx) = manual();
        let p = Promise::resolved(5).then(&ctx, Ok);
        exec.run_all();
        assert_eq!(p.value(), Some(5));
    }

    #[test]
    fn then_chain_transforms() {
        let (exec, ctx) = manual();
        let p = Promise::resolved(2)
            .then(&ctx, |v| Ok(v * 10))
            .then(&ctx, |v| Ok(format!("{v}")));
        exec.run_all();
        assert_eq!(p.value().as_deref(), Some("20"));
    }

    #[test]
    fn then_skipped_on_rejection() {
        let (exec, ctx) = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let p = Promise::<i32>::rejected(Error::Timeout).then(&ctx, move |v| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(v)
        });
        exec.run_all();
        assert!(matches!(p.error(), Some(Error::Timeout)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn and_then_flattens() {
        let (exec, ctx) = manual();
        let c = ctx.clone();
        let p = Promise::resolved(3).and_then(&ctx, move |v| {
            Promise::new(&c, move |r| {
                r.resolve(v + 1);
                Ok(())
            })
        });
        exec.run_all();
        assert_eq!(p.value(), Some(4));
    }

    #[test]
    fn then_error_and_panic_reject() {
        let (exec, ctx) = manual();
        let p = Promise::resolved(1).then::<i32, _>(&ctx, |_| Err(Error::InvalidInput));
        let q = Promise::resolved(1).then::<i32, _>(&ctx, |_| panic!("oops"));
        exec.run_all();
        assert!(matches!(p.error(), Some(Error::InvalidInput)));
        assert!(matches!(q.error(), Some(Error::Panicked(_))));
    }

    #[test]
    fn catch_handles_and_rethrows() {
        let (exec, ctx) = manual();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let handled = Promise::<i32>::rejected(Error::Timeout).catch(&ctx, move |e| {
            assert!(matches!(e, Error::Timeout));
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let rethrown =
            Promise::<i32>::rejected(Error::Timeout).catch(&ctx, |_| Err(Error::InvalidInput));
        let untouched = Promise::resolved(1).catch(&ctx, |_| Err(Error::InvalidInput));
        exec.run_all();

        assert_eq!(handled.value(), Some(()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(matches!(rethrown.error(), Some(Error::InvalidInput)));
        assert_eq!(untouched.value(), Some(()));
    }

    #[test]
    fn catch_after_then_sees_upstream_error() {
        let (exec, ctx) = manual();
        let p = Promise::<i32>::rejected(Error::other("first"))
            .then(&ctx, |v| Ok(v + 1))
            .catch(&ctx, |e| {
                assert_eq!(e.to_string(), "first");
                Ok(())
            });
        exec.run_all();
        assert_eq!(p.value(), Some(()));
    }

    #[test]
    fn recover_replaces_rejection() {
        let (exec, ctx) = manual();
        let p = Promise::<i32>::rejected(Error::Timeout).recover(&ctx, |_| Promise::resolved(7));
        let q = Promise::<i32>::rejected(Error::Timeout)
            .recover(&ctx, |_| Promise::rejected(Error::InvalidInput));
        let r = Promise::resolved(1).recover(&ctx, |_| Promise::resolved(7));
        exec.run_all();
        assert_eq!(p.value(), Some(7));
        assert!(matches!(q.error(), Some(Error::InvalidInput)));
        assert_eq!(r.value(), Some(1));
    }

    #[test]
    fn ensure_predicate() {
        let (exec, ctx) = manual();
        let ok = Promise::resolved(4).ensure(&ctx, |v| v % 2 == 0);
        let bad = Promise::resolved(3).validate(&ctx, |v| v % 2 == 0);
        exec.run_all();
        assert_eq!(ok.value(), Some(4));
        assert!(matches!(bad.error(), Some(Error::PredicateRejected)));
    }

    #[test]
    fn always_runs_and_preserves_outcome() {
        let (exec, ctx) = manual();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let a = Promise::resolved(1).always(&ctx, move || {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let h = hits.clone();
        let b = Promise::<i32>::rejected(Error::Timeout).always(&ctx, move || {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let c = Promise::resolved(1).always(&ctx, || Err(Error::InvalidInput));
        exec.run_all();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(a.value(), Some(1));
        assert!(matches!(b.error(), Some(Error::Timeout)));
        assert!(matches!(c.error(), Some(Error::InvalidInput)));
    }

    #[test]
    fn forward_and_pass_keep_value() {
        let (exec, ctx) = manual();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let a = Promise::resolved(5).forward(&ctx, move |v| {
            s.store(*v, Ordering::SeqCst);
            Ok(())
        });
        let b = Promise::resolved(5).pass(&ctx, |v| Promise::resolved(format!("{v}")));
        let c = Promise::resolved(5).forward(&ctx, |_| Err(Error::InvalidInput));
        let d = Promise::resolved(5).pass(&ctx, |_| Promise::<()>::rejected(Error::Timeout));
        exec.run_all();

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(a.value(), Some(5));
        assert_eq!(b.value(), Some(5));
        assert!(matches!(c.error(), Some(Error::InvalidInput)));
        assert!(matches!(d.error(), Some(Error::Timeout)));
    }

    #[test]
    fn cancellation_skips_handlers() {
        let (exec, ctx) = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let (h1, h2, h3, h4) = (hits.clone(), hits.clone(), hits.clone(), hits.clone());
        let c = cancelled.clone();
        let p = Promise::<i32>::cancelled_now()
            .recover(&ctx, move |_| {
                h1.fetch_add(1, Ordering::SeqCst);
                Promise::resolved(1)
            })
            .forward(&ctx, move |_| {
                h2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .then(&ctx, move |v| {
                h3.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            })
            .catch(&ctx, move |_| {
                h4.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .cancelled(&ctx, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        exec.run_all();

        assert!(p.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_handler_not_run_on_resolution() {
        let (exec, ctx) = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let p = Promise::resolved(2).cancelled(&ctx, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        exec.run_all();
        assert_eq!(p.value(), Some(2));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn always_keeps_cancellation() {
        let (exec, ctx) = manual();
        let p = Promise::<i32>::cancelled_now().always(&ctx, || Ok(()));
        exec.run_all();
        assert!(p.is_cancelled());
    }
}
