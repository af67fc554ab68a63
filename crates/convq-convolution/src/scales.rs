use crate::{attribute::OpDesc, ConvError};
use convq_quant::{CalibrationScales, QuantizationConfig, ScaleError};

/// Calibration scales and quantization settings read from the attributes of a convolution.
///
/// Shared by the graph pass and the kernel fallback so both derive from the same inputs.
#[derive(Clone, Debug)]
pub(crate) struct OpQuantization {
    pub calib: CalibrationScales,
    pub config: QuantizationConfig,
}

impl OpQuantization {
    pub fn from_op(op: &OpDesc, weight_shape: &[i64], has_bias: bool) -> Result<Self, ConvError> {
        let groups = op.get_attr_if_exists::<i32>("groups")?.max(1) as u32;

        let scale_in = op.attr::<f32>("Scale_in")?.ok_or_else(|| missing("Scale_in"))?;
        let scale_weights = op
            .attr::<Vec<f32>>("Scale_weights")?
            .ok_or_else(|| missing("Scale_weights"))?;
        let mut calib = match op.attr::<f32>("Scale_out")? {
            Some(scale_out) => CalibrationScales::new(scale_in, scale_weights, scale_out),
            None => CalibrationScales::new(scale_in, scale_weights, 1.0).without_scale_out(),
        };
        if let Some(scale) = op.attr::<f32>("Scale_in_eltwise")? {
            calib = calib.with_scale_in_eltwise(scale);
        }

        let config = QuantizationConfig::new(groups, weight_shape.to_vec())?
            .with_bias(has_bias)
            .with_force_fp32_output(op.get_attr_if_exists("force_fp32_output")?)
            .with_fuse_residual(op.get_attr_if_exists("fuse_residual_connection")?)
            .with_activation(op.attr::<String>("fuse_activation")?);

        Ok(Self { calib, config })
    }
}

fn missing(name: &str) -> ConvError {
    ScaleError::MissingScaleAttribute { name: name.into() }.into()
}
