//! A tokio-backed scheduler for promise contexts.
//!
//! The promise engine only ever submits jobs to an [`Executor`]. This module
//! provides the executors most programs want:
//!
//! - a serial **main** context, one job at a time in submission order,
//! - a shared **background** context running jobs concurrently, up to
//!   [`Config::max_concurrent_jobs`] at once,
//! - timers, so [`delay`](crate::Promise::delay) and
//!   [`timeout`](crate::Promise::timeout) never park a thread.
//!
//! Jobs may block (bodies are plain closures), so every job runs on tokio's
//! blocking pool. Shutdown follows the usual pattern: cancel, close the
//! tracker, then give running jobs [`Config::shutdown_timeout`] to finish.
//!
//! # Example
//!
//! ```no_run
//! use hardy_promise::runtime::{Config, Runtime};
//! use hardy_promise::Promise;
//!
//! let rt = Runtime::new(Config::default()).unwrap();
//! let p = Promise::new(rt.background(), |r| {
//!     r.resolve(21);
//!     Ok(())
//! })
//! .then(rt.main(), |v| Ok(v * 2));
//!
//! assert_eq!(p.wait().unwrap(), 42);
//! rt.shutdown();
//! ```

use super::*;
use crate::context::{Executor, Job};
use core::future::Future;
use core::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use trace_err::*;

pub use crate::config::Config;

// How often an idle serial context checks for shutdown
const SERIAL_POLL: std::time::Duration = std::time::Duration::from_millis(50);

/// Sleeps for the specified duration.
///
/// Zero or negative durations return immediately; durations exceeding
/// `std::time::Duration::MAX` sleep for `MAX`.
async fn sleep(duration: time::Duration) {
    if !duration.is_positive() {
        return;
    }

    let std_duration: std::time::Duration = duration.try_into().unwrap_or(std::time::Duration::MAX);

    tokio::time::sleep(std_duration).await;
}

/// Tracks every job and timer so shutdown can cancel and drain them.
struct TaskPool {
    handle: tokio::runtime::Handle,
    cancel_token: CancellationToken,
    task_tracker: tokio_util::task::TaskTracker,
}

impl TaskPool {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel_token.is_cancelled() {
            debug!("Runtime is shutting down, dropping job");
            return;
        }
        self.task_tracker.spawn_on(task, &self.handle);
    }

    /// Runs `job` after `delay` unless the runtime shuts down first.
    fn spawn_timer<E: Executor + 'static>(&self, delay: time::Duration, executor: E, job: Job) {
        let cancel = self.cancel_token.clone();
        self.spawn(async move {
            tokio::select! {
                _ = sleep(delay) => executor.execute(job),
                _ = cancel.cancelled() => {}
            }
        });
    }
}

#[derive(Clone)]
struct SerialExecutor {
    pool: Arc<TaskPool>,
    tx: flume::Sender<Job>,
}

impl SerialExecutor {
    fn start(pool: Arc<TaskPool>, label: &str) -> Self {
        let (tx, rx) = flume::unbounded();
        let cancel = pool.cancel_token.clone();
        let label = label.to_string();
        pool.task_tracker
            .spawn_blocking_on(move || drain(&label, rx, cancel), &pool.handle);
        Self { pool, tx }
    }
}

fn drain(label: &str, rx: flume::Receiver<Job>, cancel: CancellationToken) {
    debug!("Serial context '{label}' started");
    loop {
        match rx.recv_timeout(SERIAL_POLL) {
            Ok(job) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                    warn!(
                        "Job on serial context '{label}' panicked: {}",
                        Error::from_panic(payload)
                    );
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Serial context '{label}' stopped");
}

impl Executor for SerialExecutor {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            debug!("Serial context has stopped, dropping job");
        }
    }

    fn execute_after(&self, delay: time::Duration, job: Job) {
        self.pool.spawn_timer(delay, self.clone(), job)
    }
}

/// Runs jobs on the blocking pool, at most `max_concurrent` at a time.
#[derive(Clone)]
struct ConcurrentExecutor {
    pool: Arc<TaskPool>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl ConcurrentExecutor {
    fn new(pool: Arc<TaskPool>, max_concurrent: NonZeroUsize) -> Self {
        Self {
            pool,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent.into())),
        }
    }
}

impl Executor for ConcurrentExecutor {
    fn execute(&self, job: Job) {
        let semaphore = self.semaphore.clone();
        self.pool.spawn(async move {
            let Ok(permit) = semaphore.acquire_owned().await else {
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                warn!("Background job failed: {e}");
            }
            drop(permit);
        });
    }

    fn execute_after(&self, delay: time::Duration, job: Job) {
        self.pool.spawn_timer(delay, self.clone(), job)
    }
}

/// Owns the threads behind a set of [`Context`]s.
///
/// Dropping the runtime shuts it down; see [`shutdown`](Self::shutdown).
pub struct Runtime {
    config: Config,
    pool: Arc<TaskPool>,
    main: Context,
    background: Context,
    rt: Option<tokio::runtime::Runtime>,
}

impl Runtime {
    /// Starts the worker threads and the main serial context.
    #[cfg_attr(feature = "instrument", tracing::instrument(skip_all))]
    pub fn new(config: Config) -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.get())
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()?;

        let pool = Arc::new(TaskPool {
            handle: rt.handle().clone(),
            cancel_token: CancellationToken::new(),
            task_tracker: tokio_util::task::TaskTracker::new(),
        });

        let main = Context::serial("main", Arc::new(SerialExecutor::start(pool.clone(), "main")));
        let background = Context::concurrent(
            "background",
            Arc::new(ConcurrentExecutor::new(
                pool.clone(),
                config.max_concurrent_jobs,
            )),
        );

        debug!(
            "Runtime started with {} worker threads, {} concurrent background jobs",
            config.worker_threads, config.max_concurrent_jobs
        );

        Ok(Self {
            config,
            pool,
            main,
            background,
            rt: Some(rt),
        })
    }

    /// The serial main context.
    pub fn main(&self) -> &Context {
        &self.main
    }

    /// The shared concurrent background context.
    pub fn background(&self) -> &Context {
        &self.background
    }

    /// Creates an additional serial context with its own queue.
    pub fn serial(&self, label: &str) -> Context {
        Context::serial(label, Arc::new(SerialExecutor::start(self.pool.clone(), label)))
    }

    /// Creates an additional concurrent context with its own limit.
    pub fn concurrent(&self, label: &str, max_concurrent: NonZeroUsize) -> Context {
        Context::concurrent(
            label,
            Arc::new(ConcurrentExecutor::new(self.pool.clone(), max_concurrent)),
        )
    }

    /// Checks if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.pool.cancel_token.is_cancelled()
    }

    /// Shuts down, waiting up to [`Config::shutdown_timeout`] for running
    /// jobs.
    ///
    /// Jobs and timers submitted afterwards are dropped, so promises still
    /// waiting on them stay pending.
    pub fn shutdown(self) {}
}

impl Default for Runtime {
    /// Starts a runtime with the default [`Config`].
    ///
    /// # Panics
    ///
    /// Panics if the worker threads cannot be spawned.
    fn default() -> Self {
        Self::new(Config::default()).trace_expect("Failed to start promise runtime")
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.pool.cancel_token.cancel();
        self.pool.task_tracker.close();
        if let Some(rt) = self.rt.take() {
            rt.shutdown_timeout(self.config.shutdown_timeout);
        }
        debug!("Runtime stopped");
    }
}
