//! Parallel processing utilities for surface reconstruction
//!
//! Every parallel stage of the reconstruction runs inside one lazily created
//! global thread pool. Floating-point reductions are chunked with a fixed
//! chunk size and summed in chunk order, so results do not depend on the
//! number of threads or on scheduling.

use psrecon_core::{Error, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

/// Global thread pool for reconstruction stages
static GLOBAL_THREAD_POOL: OnceLock<Option<Arc<ThreadPool>>> = OnceLock::new();
static THREAD_POOL_CONFIG: Mutex<ThreadPoolConfig> = Mutex::new(ThreadPoolConfig::new());

/// Elements per partial sum in deterministic reductions
const REDUCTION_CHUNK: usize = 4096;

const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Thread pool configuration for parallel processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    /// Worker count; `None` uses one per logical CPU
    pub num_threads: Option<usize>,
    /// Worker stack size in bytes
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,
    /// Run every stage on the calling thread when false
    pub enabled: bool,
    /// Inputs shorter than this run sequentially
    pub min_parallel_len: usize,
}

impl ThreadPoolConfig {
    const fn new() -> Self {
        Self {
            num_threads: None,
            stack_size: None,
            thread_name_prefix: String::new(),
            enabled: true,
            min_parallel_len: 64,
        }
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_min_parallel_len(mut self, len: usize) -> Self {
        self.min_parallel_len = len;
        self
    }

    fn builder(&self) -> ThreadPoolBuilder {
        let mut builder = ThreadPoolBuilder::new()
            .num_threads(self.num_threads.unwrap_or_else(num_cpus::get))
            .stack_size(self.stack_size.unwrap_or(DEFAULT_STACK_SIZE));

        if !self.thread_name_prefix.is_empty() {
            let prefix = self.thread_name_prefix.clone();
            builder = builder.thread_name(move |index| format!("{}-{}", prefix, index));
        }
        builder
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            stack_size: Some(DEFAULT_STACK_SIZE),
            thread_name_prefix: "psrecon".to_string(),
            ..Self::new()
        }
    }
}

/// Install `config` for subsequent stages
///
/// The pool itself is created once; later calls only update the
/// sequential/parallel switches.
pub fn init_thread_pool(config: ThreadPoolConfig) -> Result<()> {
    if let Ok(mut global_config) = THREAD_POOL_CONFIG.lock() {
        *global_config = config.clone();
    }

    if GLOBAL_THREAD_POOL.get().is_some() {
        return Ok(());
    }

    let pool = config
        .builder()
        .build()
        .map_err(|e| Error::InvalidData(format!("failed to create thread pool: {}", e)))?;

    debug!(threads = pool.current_num_threads(), "reconstruction thread pool created");
    // Losing an initialization race leaves the other pool in place
    let _ = GLOBAL_THREAD_POOL.set(Some(Arc::new(pool)));
    Ok(())
}

/// The global pool, created with defaults on first use
///
/// `None` when the pool could not be built; stages then run on rayon's
/// implicit global pool.
pub fn thread_pool() -> Option<Arc<ThreadPool>> {
    GLOBAL_THREAD_POOL
        .get_or_init(|| match ThreadPoolConfig::default().builder().build() {
            Ok(pool) => Some(Arc::new(pool)),
            Err(e) => {
                warn!(error = %e, "falling back to the default rayon pool");
                None
            }
        })
        .clone()
}

pub fn get_config() -> ThreadPoolConfig {
    THREAD_POOL_CONFIG
        .lock()
        .map(|config| config.clone())
        .unwrap_or_else(|_| ThreadPoolConfig::default())
}

pub fn is_parallel_enabled() -> bool {
    get_config().enabled
}

/// Whether work over `len` items should be split across the pool
pub fn worth_parallel(len: usize) -> bool {
    let config = get_config();
    config.enabled && len >= config.min_parallel_len
}

/// Execute an operation inside the global thread pool
pub fn execute_parallel<F, R>(op: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    match thread_pool() {
        Some(pool) if is_parallel_enabled() => pool.install(op),
        _ => op(),
    }
}

/// Map preserving input order
pub fn parallel_map<T, U, F>(data: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync + Send,
{
    if !worth_parallel(data.len()) {
        return data.iter().map(f).collect();
    }

    execute_parallel(|| data.par_iter().map(f).collect())
}

/// Map over `0..count` preserving order
pub fn parallel_map_range<U, F>(count: usize, f: F) -> Vec<U>
where
    U: Send,
    F: Fn(usize) -> U + Sync + Send,
{
    if !worth_parallel(count) {
        return (0..count).map(f).collect();
    }

    execute_parallel(|| (0..count).into_par_iter().map(f).collect())
}

/// Sum with a fixed reduction tree
pub fn deterministic_sum(values: &[f64]) -> f64 {
    if values.len() <= REDUCTION_CHUNK || !is_parallel_enabled() {
        return chunked_sum(values);
    }
    let partials: Vec<f64> =
        execute_parallel(|| values.par_chunks(REDUCTION_CHUNK).map(|c| c.iter().sum()).collect());
    partials.iter().sum()
}

/// Dot product with a fixed reduction tree
pub fn deterministic_dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.len() <= REDUCTION_CHUNK || !is_parallel_enabled() {
        return a
            .chunks(REDUCTION_CHUNK)
            .zip(b.chunks(REDUCTION_CHUNK))
            .map(|(x, y)| x.iter().zip(y).map(|(p, q)| p * q).sum::<f64>())
            .sum();
    }
    let partials: Vec<f64> = execute_parallel(|| {
        a.par_chunks(REDUCTION_CHUNK)
            .zip(b.par_chunks(REDUCTION_CHUNK))
            .map(|(x, y)| x.iter().zip(y).map(|(p, q)| p * q).sum())
            .collect()
    });
    partials.iter().sum()
}

fn chunked_sum(values: &[f64]) -> f64 {
    values.chunks(REDUCTION_CHUNK).map(|c| c.iter().sum::<f64>()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_pool_config() {
        let config = ThreadPoolConfig::default()
            .with_threads(4)
            .with_stack_size(16 * 1024 * 1024)
            .with_min_parallel_len(128);

        assert_eq!(config.num_threads, Some(4));
        assert_eq!(config.stack_size, Some(16 * 1024 * 1024));
        assert_eq!(config.thread_name_prefix, "psrecon");
        assert_eq!(config.min_parallel_len, 128);
        assert!(config.enabled);
    }

    #[test]
    fn test_init_with_defaults() {
        init_thread_pool(ThreadPoolConfig::default()).unwrap();
        assert!(thread_pool().is_some());
        assert!(is_parallel_enabled());
    }

    #[test]
    fn test_short_inputs_stay_sequential() {
        let threshold = get_config().min_parallel_len;
        assert!(!worth_parallel(threshold.saturating_sub(1)));
    }

    #[test]
    fn test_parallel_map_preserves_order() {
        let data: Vec<i32> = (0..1000).collect();
        let result = parallel_map(&data, |x| x * 2);
        assert_eq!(result[0], 0);
        assert_eq!(result[999], 1998);

        let ranged = parallel_map_range(300, |i| i * i);
        assert_eq!(ranged[17], 289);
    }

    #[test]
    fn test_deterministic_reductions() {
        let values: Vec<f64> = (0..20000).map(|i| 1.0 / (i as f64 + 1.0)).collect();
        let first = deterministic_sum(&values);
        let second = deterministic_sum(&values);
        assert_eq!(first.to_bits(), second.to_bits());
        assert!((first - chunked_sum(&values)).abs() < 1e-9);

        let dot = deterministic_dot(&values, &values);
        assert_eq!(dot.to_bits(), deterministic_dot(&values, &values).to_bits());
        assert!(dot > 1.6 && dot < 1.65);
    }
}
