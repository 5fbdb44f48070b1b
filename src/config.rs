//! Centralized configuration for Millrace.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Millrace components.
///
/// Groups related settings into logical sections. Supports environment
/// variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct MillraceConfig {
    /// Session pool sizing, credential persistence, and rate-limit handling
    pub pool: PoolConfig,
    /// Chunking, prefetch, and lookahead behavior
    pub stream: StreamConfig,
    /// Chunk cache byte budget
    pub cache: CacheConfig,
    /// Per-chunk download retry behavior
    pub fetch: FetchConfig,
    /// Loopback HTTP server behavior
    pub server: ServerConfig,
}

/// Session pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of authenticated sessions to hold open
    pub size: usize,
    /// Credential file location; `None` uses the per-user config directory
    pub credential_path: Option<PathBuf>,
    /// Safety margin added on top of a server-specified rate-limit wait
    pub rate_limit_margin: Duration,
    /// How often the remaining rate-limit wait is logged
    pub rate_limit_log_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            credential_path: None,
            rate_limit_margin: Duration::from_secs(1),
            rate_limit_log_interval: Duration::from_secs(5),
        }
    }
}

/// Chunking and prefetch configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bytes per remote chunk pull
    pub chunk_size: usize,
    /// Prefetch workers per stream
    pub parallel_workers: usize,
    /// Head chunks fetched before playback starts
    pub prefetch_chunks: u64,
    /// Tail chunks fetched before playback starts
    pub tail_chunks: u64,
    /// Chunks fetched synchronously before serving a cache-cold range
    pub seek_prebuffer_chunks: u64,
    /// Maximum distance the prefetch cursor may run ahead of playback
    pub lookahead_chunks: u64,
    /// Pause between prefetch worker iterations
    pub worker_cooldown: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024, // 1 MiB
            parallel_workers: 9,
            prefetch_chunks: 50,
            tail_chunks: 3,
            seek_prebuffer_chunks: 10,
            lookahead_chunks: 250,
            worker_cooldown: Duration::from_millis(30),
        }
    }
}

/// Chunk cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hard byte budget for resident chunks
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 700 * 1024 * 1024, // 700 MiB
        }
    }
}

/// Per-chunk download retry configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Attempts per chunk before surfacing failure
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts
    pub backoff_base: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff_base: Duration::from_millis(200),
        }
    }
}

/// Range server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Consecutive chunk failures tolerated before a response is aborted
    pub max_consecutive_failures: u32,
    /// Pause before retrying the same byte position after a chunk failure
    pub stall_retry_delay: Duration,
    /// Depth of the bounded body channel that carries writer back-pressure
    pub body_channel_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            stall_retry_delay: Duration::from_millis(500),
            body_channel_depth: 2,
        }
    }
}

impl MillraceConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via `MILLRACE_*` environment variables
    /// while maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("MILLRACE_POOL_SIZE") {
            if let Ok(count) = size.parse::<usize>() {
                config.pool.size = count.max(1);
            }
        }

        if let Ok(workers) = std::env::var("MILLRACE_WORKERS") {
            if let Ok(count) = workers.parse::<usize>() {
                config.stream.parallel_workers = count.max(1);
            }
        }

        if let Ok(budget) = std::env::var("MILLRACE_CACHE_MAX_BYTES") {
            if let Ok(bytes) = budget.parse::<usize>() {
                config.cache.max_bytes = bytes;
            }
        }

        if let Ok(chunks) = std::env::var("MILLRACE_PREFETCH_CHUNKS") {
            if let Ok(count) = chunks.parse::<u64>() {
                config.stream.prefetch_chunks = count;
            }
        }

        if let Ok(chunks) = std::env::var("MILLRACE_LOOKAHEAD_CHUNKS") {
            if let Ok(count) = chunks.parse::<u64>() {
                config.stream.lookahead_chunks = count;
            }
        }

        config
    }

    /// Creates a configuration with small limits and short waits for tests.
    pub fn for_testing() -> Self {
        Self {
            pool: PoolConfig {
                size: 2,
                credential_path: None,
                rate_limit_margin: Duration::from_millis(50),
                rate_limit_log_interval: Duration::from_millis(200),
            },
            stream: StreamConfig {
                chunk_size: 64 * 1024,
                parallel_workers: 3,
                prefetch_chunks: 4,
                tail_chunks: 2,
                seek_prebuffer_chunks: 3,
                lookahead_chunks: 16,
                worker_cooldown: Duration::from_millis(5),
            },
            cache: CacheConfig {
                max_bytes: 8 * 1024 * 1024,
            },
            fetch: FetchConfig {
                max_retries: 4,
                backoff_base: Duration::from_millis(10),
            },
            server: ServerConfig {
                max_consecutive_failures: 5,
                stall_retry_delay: Duration::from_millis(50),
                body_channel_depth: 2,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = MillraceConfig::default();

        assert_eq!(config.pool.size, 3);
        assert_eq!(config.stream.chunk_size, 1024 * 1024);
        assert_eq!(config.stream.parallel_workers, 9);
        assert_eq!(config.stream.prefetch_chunks, 50);
        assert_eq!(config.stream.tail_chunks, 3);
        assert_eq!(config.stream.seek_prebuffer_chunks, 10);
        assert_eq!(config.stream.lookahead_chunks, 250);
        assert_eq!(config.cache.max_bytes, 700 * 1024 * 1024);
        assert_eq!(config.fetch.max_retries, 4);
        assert_eq!(config.server.max_consecutive_failures, 5);
        assert_eq!(config.server.stall_retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_testing_preset_is_small() {
        let config = MillraceConfig::for_testing();

        assert!(config.cache.max_bytes < MillraceConfig::default().cache.max_bytes);
        assert!(config.stream.worker_cooldown < Duration::from_millis(30));
        assert!(config.pool.rate_limit_margin < Duration::from_secs(1));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("MILLRACE_POOL_SIZE", "5");
            std::env::set_var("MILLRACE_WORKERS", "2");
            std::env::set_var("MILLRACE_CACHE_MAX_BYTES", "1048576");
        }

        let config = MillraceConfig::from_env();

        assert_eq!(config.pool.size, 5);
        assert_eq!(config.stream.parallel_workers, 2);
        assert_eq!(config.cache.max_bytes, 1_048_576);

        unsafe {
            std::env::remove_var("MILLRACE_POOL_SIZE");
            std::env::remove_var("MILLRACE_WORKERS");
            std::env::remove_var("MILLRACE_CACHE_MAX_BYTES");
        }
    }
}
