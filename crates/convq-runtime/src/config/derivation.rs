use convq_quant::{DerivationOptions, PARALLEL_THRESHOLD};

/// Configuration of the scale derivation.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DerivationConfig {
    /// Channel count above which per-channel scales are computed in parallel.
    #[serde(default = "parallel_threshold_default")]
    pub parallel_threshold: usize,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: parallel_threshold_default(),
        }
    }
}

impl DerivationConfig {
    /// The derivation options matching this configuration.
    pub fn options(&self) -> DerivationOptions {
        DerivationOptions {
            parallel_threshold: self.parallel_threshold,
        }
    }
}

fn parallel_threshold_default() -> usize {
    PARALLEL_THRESHOLD
}
