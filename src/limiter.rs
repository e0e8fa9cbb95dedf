//! Process-wide bound on concurrent (de)compression jobs.
//!
//! Every permessage-deflate job of every connection passes through one
//! [`Limiter`]. A job holds a semaphore permit for as long as it runs on the
//! blocking pool, so at most `concurrency` raw-deflate codecs are busy at any
//! time; further jobs wait in FIFO order for a permit. The permit moves into
//! the blocking job, so dropping the future returned by [`Limiter::run`] does
//! not free it before the job ends.

use crate::error::WsError;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;

/// Default number of concurrent compression jobs.
pub const DEFAULT_CONCURRENCY: usize = 10;

static GLOBAL: OnceLock<Limiter> = OnceLock::new();

/// Bounded-concurrency gate for CPU-heavy jobs.
#[derive(Debug)]
pub struct Limiter {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl Limiter {
    /// Create a limiter admitting `concurrency` jobs at once (at least one).
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    /// The process-wide limiter.
    ///
    /// The first caller fixes the concurrency; later values are ignored.
    pub fn global(concurrency: usize) -> &'static Self {
        GLOBAL.get_or_init(|| {
            tracing::debug!(target: "ws::deflate", concurrency, "initialized compression limiter");
            Self::new(concurrency)
        })
    }

    /// Maximum number of concurrent jobs.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `job` on the blocking pool once a permit is available.
    pub async fn run<T, F>(&self, job: F) -> Result<T, WsError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| WsError::Compression("limiter closed".into()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
            .map_err(|err| WsError::Compression(err.to_string()))
    }
}
