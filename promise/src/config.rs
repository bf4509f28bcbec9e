use core::num::NonZeroUsize;

/// Settings for the bundled [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Threads driving timers and job dispatch.
    #[cfg_attr(feature = "serde", serde(default = "default_worker_threads"))]
    pub worker_threads: NonZeroUsize,

    /// Jobs the background context runs at once; further jobs queue.
    #[cfg_attr(feature = "serde", serde(default = "default_max_concurrent_jobs"))]
    pub max_concurrent_jobs: NonZeroUsize,

    pub thread_name: String,

    /// How long shutdown waits for running jobs before abandoning them.
    pub shutdown_timeout: std::time::Duration,
}

/// Returns the number of available hardware threads, or 1 if unknown.
pub fn available_parallelism() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

fn default_worker_threads() -> NonZeroUsize {
    available_parallelism()
}

fn default_max_concurrent_jobs() -> NonZeroUsize {
    // Bodies are allowed to block, so leave plenty of headroom
    const HEADROOM: NonZeroUsize = NonZeroUsize::new(16).unwrap();
    available_parallelism().saturating_mul(HEADROOM)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            thread_name: "hardy-promise".to_string(),
            shutdown_timeout: std::time::Duration::from_secs(5),
        }
    }
}
