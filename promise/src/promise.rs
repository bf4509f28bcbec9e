//! The single-assignment state machine behind every [`Promise`].
//!
//! # Locking
//!
//! Each promise owns one `spin::Mutex` guarding its observer list and its
//! lazy-start flag. Everything done while holding it is O(1): push an
//! observer, take the whole list, or store the terminal outcome. Observers
//! are always invoked after the lock is released, so user code never runs
//! inside the critical section and can freely touch the same promise again.
//!
//! The terminal outcome lives in a `OnceLock` that is only written with the
//! mutex held. Readers that just want a snapshot skip the lock entirely.

use super::*;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;

/// The state of a [`Promise`].
///
/// A promise leaves `Pending` exactly once; whichever transition lands first
/// wins and every later attempt is ignored.
#[derive(Debug, Clone)]
pub enum State<T> {
    Pending,
    Resolved(T),
    Rejected(Error),
    Cancelled,
}

impl<T> State<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }
}

pub(crate) type Body<T> = Arc<dyn Fn(Resolver<T>) -> Result<()> + Send + Sync>;

/// Where an observer's handler runs.
#[derive(Clone)]
pub(crate) enum Target {
    /// On whichever thread settles the promise. Internal glue only.
    Inline,
    On(Context),
}

impl Target {
    fn run<F: FnOnce() + Send + 'static>(self, f: F) {
        match self {
            Target::Inline => contain(f),
            Target::On(ctx) => ctx.dispatch(move || contain(f)),
        }
    }
}

// Handlers registered through the public API must not unwind into an executor
fn contain<F: FnOnce()>(f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        warn!("Promise observer panicked: {}", Error::from_panic(payload));
    }
}

/// Runs user code, turning a panic into [`Error::Panicked`].
pub(crate) fn guard<R, F: FnOnce() -> Result<R>>(f: F) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let e = Error::from_panic(payload);
        warn!("Promise handler panicked: {e}");
        Err(e)
    })
}

/// Passes the next step of a loop back from an observer.
///
/// While the loop is still registering the observer, a step the observer
/// finds is parked here for the loop to pick up, so chains of already
/// settled promises never nest on the stack. Once registration has
/// returned, the observer gets the step back and must continue itself.
pub(crate) struct Handoff<S>(spin::Mutex<(bool, Option<S>)>);

impl<S> Handoff<S> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(spin::Mutex::new((true, None))))
    }

    pub(crate) fn hand_back(&self, step: S) -> Option<S> {
        let mut slot = self.0.lock();
        if slot.0 {
            slot.1 = Some(step);
            None
        } else {
            Some(step)
        }
    }

    pub(crate) fn finish(&self) -> Option<S> {
        let mut slot = self.0.lock();
        slot.0 = false;
        slot.1.take()
    }
}

enum Observer<T> {
    Resolve(Target, Box<dyn FnOnce(T) + Send>),
    Reject(Target, Box<dyn FnOnce(Error) + Send>),
    Cancel(Target, Box<dyn FnOnce() + Send>),
    Settle(Target, Box<dyn FnOnce(State<T>) + Send>),
}

impl<T: Clone + Send + 'static> Observer<T> {
    /// Dispatches the handler if it is interested in `state`; drops it otherwise.
    fn call(self, state: &State<T>) {
        match (self, state) {
            (Observer::Resolve(target, handler), State::Resolved(value)) => {
                let value = value.clone();
                target.run(move || handler(value))
            }
            (Observer::Reject(target, handler), State::Rejected(error)) => {
                let error = error.clone();
                target.run(move || handler(error))
            }
            (Observer::Cancel(target, handler), State::Cancelled) => target.run(handler),
            (Observer::Settle(target, handler), state) if !state.is_pending() => {
                let state = state.clone();
                target.run(move || handler(state))
            }
            _ => {}
        }
    }
}

struct Shared<T> {
    observers: Vec<Observer<T>>,
    started: bool,
}

struct Inner<T> {
    context: Option<Context>,
    token: Option<CancellationToken>,
    body: Option<Body<T>>,
    outcome: OnceLock<State<T>>,
    shared: spin::Mutex<Shared<T>>,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    fn settle(&self, state: State<T>) -> bool {
        if state.is_pending() {
            return false;
        }

        let observers = {
            let mut shared = self.shared.lock();
            if self.outcome.set(state).is_err() {
                return false;
            }
            core::mem::take(&mut shared.observers)
        };

        let Some(state) = self.outcome.get() else {
            return false;
        };
        trace!(
            "Promise settled as {}, firing {} observers",
            describe(state),
            observers.len()
        );
        for observer in observers {
            observer.call(state);
        }
        true
    }

    fn add(self: &Arc<Self>, observer: Observer<T>) {
        let (observer, start) = {
            let mut shared = self.shared.lock();
            let start = !core::mem::replace(&mut shared.started, true);
            if self.outcome.get().is_none() {
                shared.observers.push(observer);
                (None, start)
            } else {
                (Some(observer), false)
            }
        };

        if start {
            self.run_body();
        }

        // Already settled: fire straight away, outside the lock
        if let (Some(observer), Some(state)) = (observer, self.outcome.get()) {
            observer.call(state);
        }
    }

    fn start(self: &Arc<Self>) {
        let start = !core::mem::replace(&mut self.shared.lock().started, true);
        if start {
            self.run_body();
        }
    }

    fn run_body(self: &Arc<Self>) {
        let (Some(body), Some(context)) = (self.body.clone(), self.context.clone()) else {
            return;
        };
        let inner = self.clone();
        context.dispatch(move || inner.execute(body));
    }

    fn execute(self: Arc<Self>, body: Body<T>) {
        let resolver = Resolver {
            inner: self.clone(),
        };
        if resolver.is_cancelled() {
            trace!("Token cancelled before the body ran");
            resolver.cancel();
            return;
        }

        match guard(|| body(resolver.clone())) {
            Ok(()) => {
                if resolver.is_cancelled() {
                    resolver.cancel();
                }
            }
            Err(e) => {
                resolver.reject(e);
            }
        }
    }
}

fn describe<T>(state: &State<T>) -> &'static str {
    match state {
        State::Pending => "pending",
        State::Resolved(_) => "resolved",
        State::Rejected(_) => "rejected",
        State::Cancelled => "cancelled",
    }
}

/// The settling side of a promise, handed to its body.
///
/// A `Resolver` may be cloned and moved to other threads; the first call to
/// [`resolve`](Self::resolve), [`reject`](Self::reject) or
/// [`cancel`](Self::cancel) from any clone decides the outcome.
pub struct Resolver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Resolver<T> {
    /// Resolves the promise with `value`.
    ///
    /// If the promise's token has been cancelled the promise becomes
    /// [`State::Cancelled`] instead. Returns `true` if this call settled it.
    pub fn resolve(&self, value: T) -> bool {
        if self.is_cancelled() {
            return self.cancel();
        }
        self.inner.settle(State::Resolved(value))
    }

    /// Rejects the promise with `error`, or cancels it if its token is cancelled.
    pub fn reject(&self, error: Error) -> bool {
        if self.is_cancelled() {
            return self.cancel();
        }
        self.inner.settle(State::Rejected(error))
    }

    /// Drives the promise into [`State::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.inner.settle(State::Cancelled)
    }

    /// Returns `true` if the promise's token has been cancelled.
    ///
    /// Long-running bodies should poll this at safe checkpoints.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub fn token(&self) -> Option<&CancellationToken> {
        self.inner.token.as_ref()
    }

    /// Adopts a terminal state.
    pub(crate) fn complete(&self, state: State<T>) -> bool {
        match state {
            State::Pending => false,
            State::Resolved(v) => self.resolve(v),
            State::Rejected(e) => self.reject(e),
            State::Cancelled => self.cancel(),
        }
    }
}

/// A single-assignment container for the eventual result of some work.
///
/// Cloning a `Promise` yields another handle onto the same state. Values are
/// cloned once for every observer they are delivered to, so large values are
/// best wrapped in an `Arc`.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Creates a promise and schedules `body` on `context` straight away.
    ///
    /// The body settles the promise through its [`Resolver`]. Returning an
    /// `Err`, or panicking, rejects it. The body is kept so that
    /// [`retry`](Self::retry) can run it again for a fresh attempt.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use hardy_promise::{Promise, runtime::{Config, Runtime}};
    ///
    /// let rt = Runtime::new(Config::default()).unwrap();
    /// let p = Promise::new(rt.background(), |r| {
    ///     r.resolve(6);
    ///     Ok(())
    /// });
    /// assert_eq!(p.wait().unwrap(), 6);
    /// ```
    pub fn new<F>(context: &Context, body: F) -> Self
    where
        F: Fn(Resolver<T>) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_body(context.clone(), None, Arc::new(body), true)
    }

    /// As [`new`](Self::new), with a cancellation token the body can poll.
    pub fn new_with_token<F>(context: &Context, token: CancellationToken, body: F) -> Self
    where
        F: Fn(Resolver<T>) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_body(context.clone(), Some(token), Arc::new(body), true)
    }

    /// Creates a promise whose body only starts once somebody observes it,
    /// or [`start`](Self::start) is called.
    pub fn lazy<F>(context: &Context, body: F) -> Self
    where
        F: Fn(Resolver<T>) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_body(context.clone(), None, Arc::new(body), false)
    }

    /// As [`lazy`](Self::lazy), with a cancellation token.
    pub fn lazy_with_token<F>(context: &Context, token: CancellationToken, body: F) -> Self
    where
        F: Fn(Resolver<T>) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_body(context.clone(), Some(token), Arc::new(body), false)
    }

    fn from_body(
        context: Context,
        token: Option<CancellationToken>,
        body: Body<T>,
        eager: bool,
    ) -> Self {
        let p = Self::build(Some(context), token, Some(body));
        if eager {
            p.inner.start();
        }
        p
    }

    fn build(
        context: Option<Context>,
        token: Option<CancellationToken>,
        body: Option<Body<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                token,
                body,
                outcome: OnceLock::new(),
                shared: spin::Mutex::new(Shared {
                    observers: Vec::new(),
                    started: false,
                }),
            }),
        }
    }

    fn settled_with(state: State<T>) -> Self {
        let p = Self::build(None, None, None);
        p.inner.settle(state);
        p
    }

    /// A promise that is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        Self::settled_with(State::Resolved(value))
    }

    /// A promise that is already rejected with `error`.
    pub fn rejected(error: Error) -> Self {
        Self::settled_with(State::Rejected(error))
    }

    /// A promise that is already cancelled.
    pub fn cancelled_now() -> Self {
        Self::settled_with(State::Cancelled)
    }

    /// A pending promise without a body, settled by the returned resolver.
    pub fn pending(
        context: Option<Context>,
        token: Option<CancellationToken>,
    ) -> (Self, Resolver<T>) {
        let p = Self::build(context, token, None);
        p.inner.shared.lock().started = true;
        let r = Resolver {
            inner: p.inner.clone(),
        };
        (p, r)
    }

    /// Starts a lazy promise's body. Has no effect on any other promise.
    pub fn start(&self) -> &Self {
        self.inner.start();
        self
    }

    /// Returns `true` if [`rerun`](Self::rerun) starts a new attempt.
    pub(crate) fn can_rerun(&self) -> bool {
        self.inner.body.is_some() && self.inner.context.is_some()
    }

    /// A fresh attempt for [`retry`](Self::retry): a new promise running the
    /// same body, or this promise again if it has no body to re-run.
    pub(crate) fn rerun(&self) -> Self {
        match (&self.inner.body, &self.inner.context) {
            (Some(body), Some(context)) => Self::from_body(
                context.clone(),
                self.inner.token.clone(),
                body.clone(),
                true,
            ),
            _ => self.clone(),
        }
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> State<T> {
        self.inner.outcome.get().cloned().unwrap_or(State::Pending)
    }

    pub fn is_pending(&self) -> bool {
        self.inner.outcome.get().is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.outcome.get(), Some(State::Cancelled))
    }

    /// The resolved value, if the promise has resolved.
    pub fn value(&self) -> Option<T> {
        match self.inner.outcome.get() {
            Some(State::Resolved(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// The rejection error, if the promise has been rejected.
    pub fn error(&self) -> Option<Error> {
        match self.inner.outcome.get() {
            Some(State::Rejected(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// The context the body runs on, if the promise has a body.
    pub fn context(&self) -> Option<&Context> {
        self.inner.context.as_ref()
    }

    pub fn token(&self) -> Option<&CancellationToken> {
        self.inner.token.as_ref()
    }

    /// Runs `f` on `context` with the value once the promise resolves.
    pub fn on_resolve<F>(&self, context: &Context, f: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.inner
            .add(Observer::Resolve(Target::On(context.clone()), Box::new(f)));
        self
    }

    /// Runs `f` on `context` with the error once the promise is rejected.
    pub fn on_reject<F>(&self, context: &Context, f: F) -> &Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.inner
            .add(Observer::Reject(Target::On(context.clone()), Box::new(f)));
        self
    }

    /// Runs `f` on `context` once the promise is cancelled.
    pub fn on_cancel<F>(&self, context: &Context, f: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .add(Observer::Cancel(Target::On(context.clone()), Box::new(f)));
        self
    }

    pub(crate) fn when_resolved<F>(&self, target: Target, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.inner.add(Observer::Resolve(target, Box::new(f)))
    }

    pub(crate) fn when_rejected<F>(&self, target: Target, f: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.inner.add(Observer::Reject(target, Box::new(f)))
    }

    pub(crate) fn when_cancelled<F>(&self, target: Target, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.add(Observer::Cancel(target, Box::new(f)))
    }

    /// Calls `f` with the terminal state, whatever it is.
    pub(crate) fn when_settled<F>(&self, target: Target, f: F)
    where
        F: FnOnce(State<T>) + Send + 'static,
    {
        self.inner.add(Observer::Settle(target, Box::new(f)))
    }

    /// Makes `out` adopt this promise's outcome.
    pub(crate) fn forward_to(&self, out: Resolver<T>) {
        self.when_settled(Target::Inline, move |state| {
            out.complete(state);
        })
    }

    /// Passes rejection and cancellation on to `out` untouched.
    pub(crate) fn forward_failure<U>(&self, out: Resolver<U>)
    where
        U: Clone + Send + Sync + 'static,
    {
        let o = out.clone();
        self.when_rejected(Target::Inline, move |e| {
            o.reject(e);
        });
        self.when_cancelled(Target::Inline, move || {
            out.cancel();
        });
    }
}

impl<T: Clone + Send + Sync + 'static> core::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match self.inner.outcome.get() {
            Some(state) => describe(state),
            None => "pending",
        };
        f.debug_struct("Promise")
            .field("state", &state)
            .field("context", &self.inner.context)
            .finish()
    }
}

/// Runs `f` on `context` and resolves with whatever it returns.
///
/// ```no_run
/// use hardy_promise::{spawn, runtime::{Config, Runtime}};
///
/// let rt = Runtime::new(Config::default()).unwrap();
/// let p = spawn(rt.background(), || Ok(2 + 3));
/// assert_eq!(p.wait().unwrap(), 5);
/// ```
pub fn spawn<T, F>(context: &Context, f: F) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (p, r) = Promise::pending(Some(context.clone()), None);
    context.dispatch(move || match guard(f) {
        Ok(v) => {
            r.resolve(v);
        }
        Err(e) => {
            r.reject(e);
        }
    });
    p
}

/// As [`spawn`], but `f` receives a token it can poll.
///
/// If the token has been cancelled by the time `f` returns, the promise is
/// cancelled and the returned value is discarded.
pub fn spawn_with_token<T, F>(context: &Context, token: CancellationToken, f: F) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
{
    let (p, r) = Promise::pending(Some(context.clone()), Some(token.clone()));
    context.dispatch(move || {
        if token.is_cancelled() {
            r.cancel();
            return;
        }
        match guard(|| f(&token)) {
            Ok(v) => {
                r.resolve(v);
            }
            Err(e) => {
                r.reject(e);
            }
        }
    });
    p
}
