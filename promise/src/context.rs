//! Execution contexts: where bodies and handlers run.
//!
//! A [`Context`] is an opaque, cheaply clonable handle onto an [`Executor`].
//! The crate never runs user code on its own threads; it only submits jobs
//! to contexts. The scheduler behind a context is supplied by the caller,
//! either through the bundled [`Runtime`](crate::runtime::Runtime) or by
//! implementing [`Executor`] directly.
//!
//! # Example
//!
//! ```
//! use hardy_promise::{Context, Executor, Job};
//! use std::sync::Arc;
//!
//! // Runs every job on the submitting thread.
//! struct Immediate;
//!
//! impl Executor for Immediate {
//!     fn execute(&self, job: Job) {
//!         job()
//!     }
//!
//!     fn execute_after(&self, delay: time::Duration, job: Job) {
//!         if let Ok(d) = std::time::Duration::try_from(delay) {
//!             std::thread::sleep(d);
//!         }
//!         job()
//!     }
//! }
//!
//! let ctx = Context::concurrent("immediate", Arc::new(Immediate));
//! assert!(!ctx.is_serial());
//! ```

use super::*;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::Cell;

/// A unit of work submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The scheduler seam.
///
/// Implementations decide which thread runs a job. A serial executor must run
/// its jobs one at a time, in submission order.
pub trait Executor: Send + Sync {
    /// Submits `job` for execution as soon as possible.
    fn execute(&self, job: Job);

    /// Submits `job` for execution once `delay` has elapsed.
    ///
    /// Zero or negative delays behave like [`execute`](Executor::execute).
    fn execute_after(&self, delay: time::Duration, job: Job);
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

// Id and serial flag of the context whose job the thread is running
thread_local! {
    static CURRENT: Cell<(usize, bool)> = const { Cell::new((0, false)) };
}

/// Returns `true` if the calling thread is running a job of any serial context.
pub(crate) fn on_serial() -> bool {
    CURRENT.with(|c| c.get().1)
}

struct Inner {
    id: usize,
    label: String,
    serial: bool,
    executor: Arc<dyn Executor>,
}

/// Handle identifying where a callback must run.
#[derive(Clone)]
pub struct Context(Arc<Inner>);

impl Context {
    /// Creates a serial context: jobs run one at a time, in order.
    pub fn serial(label: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self::new(label.into(), true, executor)
    }

    /// Creates a concurrent context: jobs may run in parallel.
    pub fn concurrent(label: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self::new(label.into(), false, executor)
    }

    fn new(label: String, serial: bool, executor: Arc<dyn Executor>) -> Self {
        Self(Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            label,
            serial,
            executor,
        }))
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn is_serial(&self) -> bool {
        self.0.serial
    }

    /// Returns `true` if the calling thread is currently running a job
    /// submitted through this context.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| c.get().0 == self.0.id)
    }

    /// Submits `f` to run on this context.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current = (self.0.id, self.0.serial);
        self.0.executor.execute(Box::new(move || run_as(current, f)));
    }

    /// Submits `f` to run on this context after `delay`.
    pub fn dispatch_after<F>(&self, delay: time::Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current = (self.0.id, self.0.serial);
        self.0.executor.execute_after(delay, Box::new(move || run_as(current, f)));
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Context {}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("label", &self.0.label)
            .field("serial", &self.0.serial)
            .finish()
    }
}

// Restores the previous marker even if `f` unwinds
struct Restore((usize, bool));

impl Drop for Restore {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.0));
    }
}

fn run_as<F: FnOnce()>(current: (usize, bool), f: F) {
    let _restore = Restore(CURRENT.with(|c| c.replace(current)));
    f()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records jobs instead of running them, so tests can step through them.
    #[derive(Default)]
    pub(crate) struct Manual {
        pub jobs: Mutex<Vec<(time::Duration, Job)>>,
    }

    impl Manual {
        pub fn run_all(&self) -> usize {
            let mut n = 0;
            loop {
                let next = {
                    let mut jobs = self.jobs.lock().unwrap();
                    if jobs.is_empty() {
                        break;
                    }
                    jobs.remove(0)
                };
                (next.1)();
                n += 1;
            }
            n
        }
    }

    impl Executor for Manual {
        fn execute(&self, job: Job) {
            self.jobs.lock().unwrap().push((time::Duration::ZERO, job));
        }

        fn execute_after(&self, delay: time::Duration, job: Job) {
            self.jobs.lock().unwrap().push((delay, job));
        }
    }

    #[test]
    fn current_marker_is_scoped_to_job() {
        let exec = Arc::new(Manual::default());
        let a = Context::serial("a", exec.clone());
        let b = Context::concurrent("b", exec.clone());
        assert_ne!(a, b);
        assert!(!a.is_current());

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let (a2, b2, seen) = (a.clone(), b.clone(), seen.clone());
            a.dispatch(move || seen.lock().unwrap().push((a2.is_current(), b2.is_current())));
        }
        {
            let (a2, b2, seen) = (a.clone(), b.clone(), seen.clone());
            b.dispatch_after(time::Duration::seconds(1), move || {
                seen.lock().unwrap().push((a2.is_current(), b2.is_current()))
            });
        }

        assert_eq!(exec.run_all(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![(true, false), (false, true)]);
        assert!(!a.is_current());
        assert!(!b.is_current());
    }

    #[test]
    fn serial_flag_follows_the_running_job() {
        let exec = Arc::new(Manual::default());
        let a = Context::serial("a", exec.clone());
        let b = Context::concurrent("b", exec.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let b2 = b.clone();
        a.dispatch(move || {
            let s2 = s.clone();
            s.lock().unwrap().push(on_serial());
            b2.dispatch(move || s2.lock().unwrap().push(on_serial()));
        });

        exec.run_all();
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
        assert!(!on_serial());
    }

    #[test]
    fn marker_restored_after_panic() {
        let exec = Arc::new(Manual::default());
        let a = Context::serial("a", exec.clone());
        a.dispatch(|| panic!("boom"));

        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| exec.run_all()));
        assert!(r.is_err());
        assert!(!a.is_current());
    }
}
