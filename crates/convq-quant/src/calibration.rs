use serde::{Deserialize, Serialize};

/// Floating-point scales captured offline by calibration for one convolution.
///
/// Immutable once attached to a node.
#[derive(new, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationScales {
    /// Scale of the quantized input activation.
    pub scale_in: f32,
    /// Weight scales, either a single global value or one per output channel.
    pub scale_weights: Vec<f32>,
    /// Scale of the quantized output.
    pub scale_out: f32,
    /// Scale of the residual branch input, only meaningful with residual fusion.
    #[new(default)]
    pub scale_in_eltwise: Option<f32>,
    /// Whether `scale_out` was actually provided by calibration.
    #[new(value = "true")]
    pub scale_out_is_set: bool,
}

impl CalibrationScales {
    /// Set the residual branch input scale.
    pub fn with_scale_in_eltwise(mut self, scale: f32) -> Self {
        self.scale_in_eltwise = Some(scale);
        self
    }

    /// Mark the output scale as absent, for outputs kept in floating point.
    pub fn without_scale_out(mut self) -> Self {
        self.scale_out = 1.0;
        self.scale_out_is_set = false;
        self
    }

    /// Whether a distinct scale is used per output channel.
    pub fn is_multi_channel(&self) -> bool {
        self.scale_weights.len() > 1
    }

    /// The weight scale of `channel`, broadcasting a single global scale to every channel.
    pub fn weight_scale(&self, channel: usize) -> f32 {
        match self.scale_weights.as_slice() {
            [scale] => *scale,
            scales => scales[channel],
        }
    }
}
