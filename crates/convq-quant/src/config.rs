use crate::ScaleError;
use serde::{Deserialize, Serialize};

/// Static description of a convolution relevant to its quantization.
///
/// Built once from the operator attributes and validated at construction, derivation never
/// re-queries the attributes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    groups: u32,
    weight_shape: Vec<i64>,
    has_bias: bool,
    force_fp32_output: bool,
    fuse_residual: bool,
    activation_kind: Option<String>,
}

impl QuantizationConfig {
    /// Create a configuration for a convolution with the given group count and weight shape.
    ///
    /// The weight shape is either `[o, i, kh, kw]` or the group prefixed `[g, o, i, kh, kw]`.
    pub fn new(groups: u32, weight_shape: Vec<i64>) -> Result<Self, ScaleError> {
        if groups == 0 {
            return Err(ScaleError::invalid("groups must be at least 1"));
        }
        if !matches!(weight_shape.len(), 4 | 5) {
            return Err(ScaleError::invalid(format!(
                "weights must have 4 dimensions, or 5 with a group prefix, got {:?}",
                weight_shape
            )));
        }
        if let Some(dim) = weight_shape.iter().find(|dim| **dim <= 0) {
            return Err(ScaleError::invalid(format!(
                "weight dimensions must be positive, got {dim} in {weight_shape:?}"
            )));
        }

        Ok(Self {
            groups,
            weight_shape,
            has_bias: false,
            force_fp32_output: false,
            fuse_residual: false,
            activation_kind: None,
        })
    }

    /// Set whether the convolution has a bias input.
    pub fn with_bias(mut self, has_bias: bool) -> Self {
        self.has_bias = has_bias;
        self
    }

    /// Set whether the output is kept in floating point.
    pub fn with_force_fp32_output(mut self, force_fp32_output: bool) -> Self {
        self.force_fp32_output = force_fp32_output;
        self
    }

    /// Set whether a residual elementwise addition is fused into the convolution.
    pub fn with_fuse_residual(mut self, fuse_residual: bool) -> Self {
        self.fuse_residual = fuse_residual;
        self
    }

    /// Set the fused activation. An empty name means no activation.
    pub fn with_activation<S: Into<String>>(mut self, activation: Option<S>) -> Self {
        self.activation_kind = activation.map(Into::into).filter(|name| !name.is_empty());
        self
    }

    /// Number of convolution groups.
    pub fn groups(&self) -> u32 {
        self.groups
    }

    /// Weight shape used to count channels.
    pub fn weight_shape(&self) -> &[i64] {
        &self.weight_shape
    }

    /// Whether the convolution has a bias input.
    pub fn has_bias(&self) -> bool {
        self.has_bias
    }

    /// Whether the output is kept in floating point.
    pub fn force_fp32_output(&self) -> bool {
        self.force_fp32_output
    }

    /// Whether a residual addition is fused.
    pub fn fuse_residual(&self) -> bool {
        self.fuse_residual
    }

    /// The fused activation, if any.
    pub fn activation_kind(&self) -> Option<&str> {
        self.activation_kind.as_deref()
    }

    /// Whether an activation is fused.
    pub fn has_activation(&self) -> bool {
        self.activation_kind.is_some()
    }
}
