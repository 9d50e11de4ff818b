//! Engine-wide tunables. Persistence and HTTP/CLI configuration are out of
//! scope; this only covers the knobs the build path and the default
//! `Mutations` request actually consume.

/// Default size of [`crate::domain::sequence_column::SequenceColumnPartition`]'s
/// build-time row buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default `min_proportion` used when a `Mutations` request omits one.
pub const DEFAULT_MIN_PROPORTION: f64 = 0.0;

/// Runtime configuration for the build path and query defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of worker threads in the rayon pool used for the parallel
    /// build and query fan-out. `None` defers to rayon's own CPU-count
    /// heuristic.
    pub worker_threads: Option<usize>,
    /// Row-buffer size before a [`crate::domain::sequence_column::SequenceColumnPartition`]
    /// flushes into its bitmap indices.
    pub buffer_size: usize,
    /// `min_proportion` used by `Mutations` when the request omits one.
    pub default_min_proportion: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            default_min_proportion: DEFAULT_MIN_PROPORTION,
        }
    }
}

impl EngineConfig {
    /// Reads `SILO_WORKER_THREADS` and `SILO_BUFFER_SIZE` from the process
    /// environment, falling back to defaults for anything unset or
    /// unparsable. There is no config-file format: on-disk configuration
    /// loading belongs to the out-of-scope server surface.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("SILO_WORKER_THREADS") {
            if let Ok(threads) = raw.parse() {
                config.worker_threads = Some(threads);
            }
        }
        if let Ok(raw) = std::env::var("SILO_BUFFER_SIZE") {
            if let Ok(size) = raw.parse() {
                config.buffer_size = size;
            }
        }
        config
    }

    /// Builds a rayon thread pool honoring [`Self::worker_threads`].
    pub fn build_thread_pool(&self) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = self.worker_threads {
            builder = builder.num_threads(threads);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.default_min_proportion, 0.0);
        assert_eq!(config.worker_threads, None);
    }
}
