use super::logger::{BinaryLogLevel, LoggerConfig};

/// Configuration of the graph passes.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PassConfig {
    /// Logger reporting the scales attached to each node.
    #[serde(default)]
    pub logger: LoggerConfig<PassLogLevel>,
}

/// Verbosity of the pass logger.
pub type PassLogLevel = BinaryLogLevel;
