use crate::{
    cache::{CacheStats, ScaleCache},
    config::{GlobalConfig, Logger},
};
use alloc::sync::Arc;
use convq_common::stream_id::StreamId;
use convq_quant::DerivationOptions;

/// Owns everything that outlives a single inference call: the scale cache and the settings read
/// from the global configuration.
///
/// Dropping the context releases every cached artifact.
#[derive(Debug)]
pub struct ExecutionContext {
    cache: ScaleCache,
    config: Arc<GlobalConfig>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Create a context using the global configuration.
    pub fn new() -> Self {
        Self::with_config(GlobalConfig::get())
    }

    /// Create a context using an explicit configuration.
    pub fn with_config(config: Arc<GlobalConfig>) -> Self {
        Self {
            cache: ScaleCache::new(Logger::from_config(config.clone())),
            config,
        }
    }

    /// The scale cache.
    pub fn cache(&self) -> &ScaleCache {
        &self.cache
    }

    /// The configuration this context was created with.
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Counters of the scale cache.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The stream used in cache keys for calls made from the current thread.
    pub fn stream(&self) -> StreamId {
        if self.config.cache.per_stream {
            StreamId::current()
        } else {
            StreamId::SHARED
        }
    }

    /// Options used when scales are derived at inference time.
    pub fn derivation_options(&self) -> DerivationOptions {
        self.config.derivation.options()
    }
}
