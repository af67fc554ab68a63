use super::logger::{LogLevel, LoggerConfig};

/// Configuration of the scale and reorder cache.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// Logger for cache hits, misses and reorder executions.
    #[serde(default)]
    pub logger: LoggerConfig<CacheLogLevel>,

    /// Whether cache keys carry the stream of the calling thread.
    ///
    /// Disabling it is only sound when a single thread drives every operator.
    #[serde(default = "per_stream_default")]
    pub per_stream: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            per_stream: per_stream_default(),
        }
    }
}

fn per_stream_default() -> bool {
    true
}

/// Verbosity of the cache logger.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum CacheLogLevel {
    /// Nothing is logged.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,
    /// Misses and reorder executions are logged.
    #[serde(rename = "minimal")]
    Minimal,
    /// Every lookup is logged.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for CacheLogLevel {}
