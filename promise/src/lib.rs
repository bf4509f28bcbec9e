//! Callback-driven promises for Hardy.
//!
//! A [`Promise`] is a single-assignment container for a value that will be
//! produced later, by a body running on some [`Context`]. It settles exactly
//! once, as resolved, rejected or cancelled, and notifies every observer
//! registered before or after that moment.
//!
//! On top of the state machine the crate provides:
//!
//! - chaining: [`then`](Promise::then), [`catch`](Promise::catch),
//!   [`recover`](Promise::recover), [`ensure`](Promise::ensure),
//!   [`always`](Promise::always), [`forward`](Promise::forward),
//!   [`pass`](Promise::pass)
//! - timing: [`delay`](Promise::delay), [`timeout`](Promise::timeout)
//! - retry: [`retry`](Promise::retry), [`retry_when`](Promise::retry_when)
//! - fan-in and fan-out: [`all`], [`any`], [`zip`], [`map`], [`reduce`]
//! - cooperative cancellation through [`CancellationToken`]
//! - a blocking bridge for synchronous callers: [`wait`](Promise::wait)
//!
//! The engine never owns threads. Contexts submit jobs to an [`Executor`];
//! with the default `tokio` feature, [`runtime::Runtime`] supplies a serial
//! main context and a bounded background context.
//!
//! # Example
//!
//! ```no_run
//! use hardy_promise::{Promise, runtime::Runtime};
//!
//! let rt = Runtime::default();
//! let answer = Promise::new(rt.background(), |r| {
//!     r.resolve(6);
//!     Ok(())
//! })
//! .then(rt.background(), |v| Ok(v * 7))
//! .timeout(rt.background(), time::Duration::seconds(1), None);
//!
//! assert_eq!(answer.wait().unwrap(), 42);
//! ```

mod bridge;
mod error;
mod join;
mod promise;
mod retry;
mod then;
mod timing;

pub mod cancellation_token;
pub mod config;
pub mod context;

#[cfg(feature = "tokio")]
pub mod runtime;

use std::sync::Arc;
use tracing::{debug, trace, warn};

pub use cancellation_token::CancellationToken;
pub use config::available_parallelism;
pub use context::{Context, Executor, Job};
pub use error::{Error, Result};
pub use join::{MapMode, all, all_bounded, any, map, reduce, zip, zip3, zip4};
pub use promise::{Promise, Resolver, State, spawn, spawn_with_token};
