//! Parallel processing across tickers
//!
//! Feature extraction and scoring are sequential within a ticker and
//! parallel across tickers. Without the `parallel` feature every helper
//! falls back to a plain sequential loop with identical results.
//!
//! [`WorkerPool`] decides which rayon pool that work lands on: a dedicated
//! pool when `num_threads` is configured, the global one otherwise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::check_range;
use crate::error::ConfigError;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Configuration for parallel processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Number of worker threads (0 = auto-detect CPU count)
    pub num_threads: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self { num_threads: 0 }
    }
}

impl ParallelConfig {
    /// Get actual number of threads to use
    pub fn actual_threads(&self) -> usize {
        if self.num_threads == 0 {
            #[cfg(feature = "parallel")]
            {
                num_cpus::get().max(1)
            }
            #[cfg(not(feature = "parallel"))]
            {
                1
            }
        } else {
            self.num_threads
        }
    }

    /// Create a new config with specified thread count
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = threads;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("parallel.num_threads", self.num_threads as f64, 0.0, 4096.0)
    }
}

/// Pool that scoring and training fan out on
#[derive(Debug, Clone)]
pub struct WorkerPool {
    threads: usize,
    #[cfg(feature = "parallel")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl WorkerPool {
    pub fn new(config: &ParallelConfig) -> Result<Self, ConfigError> {
        let threads = config.actual_threads();

        #[cfg(feature = "parallel")]
        let pool = if config.num_threads == 0 {
            None
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("tapewatch-worker-{i}"))
                .build()
                .map_err(|e| ConfigError::InvalidParameter {
                    name: "parallel.num_threads",
                    reason: e.to_string(),
                })?;
            Some(Arc::new(pool))
        };

        debug!(threads, dedicated = config.num_threads > 0, "worker pool ready");
        Ok(Self {
            threads,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    /// Threads available to parallel work run through this pool
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `f` so that `par_map` and `join` inside it use this pool
    #[cfg(feature = "parallel")]
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    #[cfg(not(feature = "parallel"))]
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        f()
    }
}

/// Thread-safe counters for scoring runs
#[derive(Debug, Default)]
pub struct ScoringStats {
    /// Series scored
    pub series_scored: AtomicU64,
    /// Verdicts produced
    pub verdicts: AtomicU64,
    /// Verdicts carrying a pattern label
    pub flagged: AtomicU64,
    /// Verdicts with at least one detector missing
    pub partial: AtomicU64,
}

impl ScoringStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create shared stats
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Record one scored series (thread-safe)
    #[inline]
    pub fn record_series(&self, verdicts: u64, flagged: u64, partial: u64) {
        self.series_scored.fetch_add(1, Ordering::Relaxed);
        self.verdicts.fetch_add(verdicts, Ordering::Relaxed);
        self.flagged.fetch_add(flagged, Ordering::Relaxed);
        self.partial.fetch_add(partial, Ordering::Relaxed);
    }

    pub fn get_series(&self) -> u64 {
        self.series_scored.load(Ordering::Relaxed)
    }

    pub fn get_verdicts(&self) -> u64 {
        self.verdicts.load(Ordering::Relaxed)
    }

    pub fn get_flagged(&self) -> u64 {
        self.flagged.load(Ordering::Relaxed)
    }

    pub fn get_partial(&self) -> u64 {
        self.partial.load(Ordering::Relaxed)
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.series_scored.store(0, Ordering::Relaxed);
        self.verdicts.store(0, Ordering::Relaxed);
        self.flagged.store(0, Ordering::Relaxed);
        self.partial.store(0, Ordering::Relaxed);
    }
}

/// Map over a slice in parallel, keeping input order
#[cfg(feature = "parallel")]
pub fn par_map<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Send + Sync,
{
    items.par_iter().map(f).collect()
}

/// Map over a slice, keeping input order (non-parallel fallback)
#[cfg(not(feature = "parallel"))]
pub fn par_map<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    F: Fn(&T) -> R,
{
    items.iter().map(f).collect()
}

/// Run two closures, concurrently when possible
#[cfg(feature = "parallel")]
pub fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    rayon::join(a, b)
}

/// Run two closures one after the other (non-parallel fallback)
#[cfg(not(feature = "parallel"))]
pub fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA,
    B: FnOnce() -> RB,
{
    (a(), b())
}
