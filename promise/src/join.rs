//! Fan-in and fan-out combinators.
//!
//! Results always come back in input order, whatever order the inputs
//! settle in. The first rejection (or cancellation) settles the combined
//! promise; the remaining inputs are abandoned, not cancelled.

use super::*;
use crate::promise::{Handoff, Target, guard};
use std::collections::VecDeque;

struct Slots<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

/// Resolves with every input's value, in input order, once all resolve.
///
/// An empty input resolves immediately with an empty `Vec`.
#[cfg_attr(feature = "instrument", tracing::instrument(skip_all))]
pub fn all<T, I>(promises: I) -> Promise<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<_> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::resolved(Vec::new());
    }

    let (next, out) = Promise::pending(None, None);
    let slots = Arc::new(spin::Mutex::new(Slots {
        values: (0..promises.len()).map(|_| None).collect(),
        remaining: promises.len(),
    }));

    for (index, promise) in promises.iter().enumerate() {
        let slots = slots.clone();
        let out = out.clone();
        promise.when_settled(Target::Inline, move |state| match state {
            State::Resolved(value) => {
                let done = {
                    let mut slots = slots.lock();
                    slots.values[index] = Some(value);
                    slots.remaining -= 1;
                    (slots.remaining == 0).then(|| core::mem::take(&mut slots.values))
                };
                if let Some(values) = done {
                    out.resolve(values.into_iter().flatten().collect());
                }
            }
            state => {
                out.complete(state.map_value());
            }
        });
    }
    next
}

/// As [`all`], but observes at most `concurrency` inputs at a time.
///
/// Inputs are taken in batches of `concurrency`; a batch is only observed
/// once the previous one has resolved, so [`lazy`](Promise::lazy) inputs do
/// not start early. Zero concurrency is rejected with [`Error::InvalidInput`].
pub fn all_bounded<T, I>(promises: I, concurrency: usize) -> Promise<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    if concurrency == 0 {
        return Promise::rejected(Error::InvalidInput);
    }

    let mut promises = promises.into_iter().peekable();
    let mut batches = VecDeque::new();
    while promises.peek().is_some() {
        batches.push_back(promises.by_ref().take(concurrency).collect::<Vec<_>>());
    }

    let (next, out) = Promise::pending(None, None);
    let batched = Arc::new(spin::Mutex::new(Batches {
        pending: batches,
        values: Vec::new(),
    }));
    drive_batches(batched, out);
    next
}

struct Batches<T> {
    pending: VecDeque<Vec<Promise<T>>>,
    values: Vec<T>,
}

fn drive_batches<T>(batched: Arc<spin::Mutex<Batches<T>>>, out: Resolver<Vec<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let batch = batched.lock().pending.pop_front();
        let Some(batch) = batch else {
            let values = core::mem::take(&mut batched.lock().values);
            out.resolve(values);
            return;
        };

        let handoff = Handoff::new();
        let (b, o, h) = (batched.clone(), out.clone(), handoff.clone());
        all(batch).when_settled(Target::Inline, move |state| match state {
            State::Resolved(values) => {
                b.lock().values.extend(values);
                if h.hand_back(()).is_some() {
                    drive_batches(b, o);
                }
            }
            state => {
                o.complete(state);
            }
        });
        if handoff.finish().is_none() {
            return;
        }
    }
}

/// Settles like whichever input settles first.
///
/// An empty input is rejected with [`Error::InvalidInput`].
pub fn any<T, I>(promises: I) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<_> = promises.into_iter().collect();
    if promises.is_empty() {
        return Promise::rejected(Error::InvalidInput);
    }

    let (next, out) = Promise::pending(None, None);
    for promise in &promises {
        promise.forward_to(out.clone());
    }
    next
}

// Only called once `all` over the same promises has resolved
fn settled_value<T: Clone + Send + Sync + 'static>(promise: &Promise<T>) -> Result<T> {
    promise.value().ok_or(Error::InvalidInput)
}

/// Joins two promises of different types into a tuple.
pub fn zip<A, B>(a: Promise<A>, b: Promise<B>) -> Promise<(A, B)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    all([a.void(), b.void()])
        .then_on(Target::Inline, move |_| Ok((settled_value(&a)?, settled_value(&b)?)))
}

/// Joins three promises into a tuple.
pub fn zip3<A, B, C>(a: Promise<A>, b: Promise<B>, c: Promise<C>) -> Promise<(A, B, C)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    all([a.void(), b.void(), c.void()]).then_on(Target::Inline, move |_| {
        Ok((settled_value(&a)?, settled_value(&b)?, settled_value(&c)?))
    })
}

/// Joins four promises into a tuple.
pub fn zip4<A, B, C, D>(
    a: Promise<A>,
    b: Promise<B>,
    c: Promise<C>,
    d: Promise<D>,
) -> Promise<(A, B, C, D)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    all([a.void(), b.void(), c.void(), d.void()]).then_on(Target::Inline, move |_| {
        Ok((
            settled_value(&a)?,
            settled_value(&b)?,
            settled_value(&c)?,
            settled_value(&d)?,
        ))
    })
}

/// How [`map`] schedules its transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Start every transform at once.
    Parallel,
    /// Start each transform only after the previous one resolved.
    Series,
}

/// Maps every item to a promise with `transform` and collects the values in
/// item order.
///
/// Transforms are called on `context`. In [`MapMode::Series`] a rejection
/// stops the remaining items from being started at all.
#[cfg_attr(feature = "instrument", tracing::instrument(skip(context, items, transform)))]
pub fn map<A, B, I, F>(context: &Context, mode: MapMode, items: I, transform: F) -> Promise<Vec<B>>
where
    A: Send + 'static,
    B: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = A>,
    F: Fn(A) -> Promise<B> + Send + Sync + 'static,
{
    let items: Vec<A> = items.into_iter().collect();
    match mode {
        MapMode::Parallel => Promise::resolved(()).and_then(context, move |_| {
            match guard(|| Ok(items.into_iter().map(transform).collect::<Vec<_>>())) {
                Ok(promises) => all(promises),
                Err(e) => Promise::rejected(e),
            }
        }),
        MapMode::Series => {
            let transform = Arc::new(transform);
            items
                .into_iter()
                .fold(Promise::resolved(Vec::new()), |chain, item| {
                    let transform = transform.clone();
                    chain.and_then(context, move |mut results: Vec<B>| {
                        (*transform)(item).then_on(Target::Inline, move |value| {
                            results.push(value);
                            Ok(results)
                        })
                    })
                })
        }
    }
}

/// Threads an accumulator through `items` in order.
///
/// Each step calls `combine(accumulator, item)` on `context` and waits for
/// the promise it returns. The first failing step rejects the result and no
/// further steps run.
pub fn reduce<A, Acc, I, F>(context: &Context, items: I, initial: Acc, combine: F) -> Promise<Acc>
where
    A: Send + 'static,
    Acc: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = A>,
    F: Fn(Acc, A) -> Promise<Acc> + Send + Sync + 'static,
{
    let combine = Arc::new(combine);
    items
        .into_iter()
        .fold(Promise::resolved(initial), |chain, item| {
            let combine = combine.clone();
            chain.and_then(context, move |acc| (*combine)(acc, item))
        })
}

impl<T> State<T> {
    /// Carries a non-resolved state over to another value type.
    pub(crate) fn map_value<U>(self) -> State<U> {
        match self {
            State::Resolved(_) | State::Pending => State::Pending,
            State::Rejected(e) => State::Rejected(e),
            State::Cancelled => State::Cancelled,
        }
    }
}
