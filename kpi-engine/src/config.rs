use serde::Deserialize;
use std::num::NonZeroUsize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Pool thread count cannot be 0")]
    ZeroThreads,

    #[error("Pool queue capacity cannot be 0")]
    ZeroQueueCapacity,

    #[error("Cache capacity cannot be 0")]
    ZeroCacheCapacity,

    #[error("Empty export marker")]
    EmptyExportMarker,

    #[error("Task timeout cannot be 0")]
    ZeroTaskTimeout,
}

/// Engine configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Worker pool shared by every batch of the process
    #[serde(default)]
    pub pool: PoolConfig,
    /// In-process result cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Rank of the project level in the hierarchy. Requests targeting a finer
    /// level (higher rank) are never cached.
    #[serde(default = "default_project_level")]
    pub project_level: u32,
    /// Tracker ids containing this marker are exports and bypass the cache.
    #[serde(default = "default_export_marker")]
    pub export_marker: String,
    /// Deadline for all metric tasks of one batch. Unset waits indefinitely.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

impl Config {
    /// Validates the engine configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pool.validate()?;
        self.cache.validate()?;

        if self.export_marker.is_empty() {
            return Err(ValidationError::EmptyExportMarker);
        }

        if self.task_timeout_secs == Some(0) {
            return Err(ValidationError::ZeroTaskTimeout);
        }

        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            project_level: default_project_level(),
            export_marker: default_export_marker(),
            task_timeout_secs: None,
        }
    }
}

fn default_project_level() -> u32 {
    4
}

fn default_export_marker() -> String {
    "export".into()
}

/// Worker pool sizing
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Number of worker threads. Defaults to the available hardware concurrency.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Maximum number of metric jobs queued or running at once across all batches.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.threads == Some(0) {
            return Err(ValidationError::ZeroThreads);
        }
        if self.queue_capacity == 0 {
            return Err(ValidationError::ZeroQueueCapacity);
        }
        Ok(())
    }

    /// Resolves the configured thread count against the host.
    pub fn thread_count(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        })
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            threads: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

/// Result cache sizing
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_capacity == 0 {
            return Err(ValidationError::ZeroCacheCapacity);
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> u64 {
    1000
}

fn default_cache_ttl_secs() -> u64 {
    3600
}
