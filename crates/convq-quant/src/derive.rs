use crate::{CalibrationScales, QuantizationConfig, ScaleError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Channel count above which per-channel loops are spread over the worker pool.
pub const PARALLEL_THRESHOLD: usize = 50;

/// Tuning knobs of the derivation that don't affect its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DerivationOptions {
    /// Per-channel loops run in parallel when the channel count is strictly above this value.
    pub parallel_threshold: usize,
}

impl Default for DerivationOptions {
    fn default() -> Self {
        Self {
            parallel_threshold: PARALLEL_THRESHOLD,
        }
    }
}

/// Requantization factors consumed by an int8 convolution primitive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DerivedScales {
    /// Factor applied to the integer accumulator of each output channel.
    pub output_shift_scale: Vec<f32>,
    /// Rescale between the residual branch and the convolution output.
    pub sum_scale: f32,
    /// Output scale applied by the fused activation post-op.
    pub activation_scale: f32,
    /// Per-channel factor bringing a float bias into the accumulator domain.
    pub bias_scale: Option<Vec<f32>>,
}

/// Number of distinct output scales.
///
/// One when a single global weight scale is used, otherwise the output channel count, which for
/// grouped convolutions spans the first two weight dimensions.
pub fn channel_count(calib: &CalibrationScales, config: &QuantizationConfig) -> usize {
    if !calib.is_multi_channel() {
        return 1;
    }

    let shape = config.weight_shape();
    let count = if config.groups() > 1 {
        shape[0] * shape[1]
    } else {
        shape[0]
    };

    count as usize
}

/// Mask of the dimensions carrying a distinct scale when reordering a per-channel tensor, like
/// the bias: dimension 0 when there is more than one scale.
pub fn scale_mask(scales: &[f32]) -> i32 {
    if scales.len() > 1 { 1 << 0 } else { 0 }
}

/// Same as [scale_mask], with the group dimension also scaled for grouped weights.
pub fn grouped_scale_mask(calib: &CalibrationScales, config: &QuantizationConfig) -> i32 {
    match (calib.is_multi_channel(), config.groups() != 1) {
        (false, _) => 0,
        (true, false) => 1 << 0,
        (true, true) => (1 << 1) + (1 << 0),
    }
}

/// Mask of the output scales attribute: per destination channel (dim 1) or global.
pub fn output_scale_mask(output_shift_scale: &[f32]) -> i32 {
    if output_shift_scale.len() > 1 { 1 << 1 } else { 0 }
}

/// Where the calibrated output scale is applied.
#[derive(Clone, Copy, Debug, PartialEq)]
struct OutputRouting {
    activation_scale: f32,
    scale_out_data: f32,
}

impl OutputRouting {
    fn new(calib: &CalibrationScales, config: &QuantizationConfig) -> Self {
        if config.force_fp32_output() {
            Self {
                activation_scale: 1.0,
                scale_out_data: 1.0,
            }
        } else if config.has_activation() {
            // The activation post-op carries the output scale.
            Self {
                activation_scale: calib.scale_out,
                scale_out_data: 1.0,
            }
        } else {
            Self {
                activation_scale: 1.0,
                scale_out_data: calib.scale_out,
            }
        }
    }
}

/// Derive every requantization factor of a convolution.
pub fn derive(
    calib: &CalibrationScales,
    config: &QuantizationConfig,
) -> Result<DerivedScales, ScaleError> {
    derive_with(calib, config, DerivationOptions::default())
}

/// Derive every requantization factor of a convolution with explicit options.
pub fn derive_with(
    calib: &CalibrationScales,
    config: &QuantizationConfig,
    options: DerivationOptions,
) -> Result<DerivedScales, ScaleError> {
    let count = validate(calib, config)?;
    let routing = OutputRouting::new(calib, config);

    let sum_scale = if config.fuse_residual() {
        let scale_in_eltwise = calib
            .scale_in_eltwise
            .ok_or_else(|| ScaleError::missing("Scale_in_eltwise"))?;
        routing.scale_out_data / scale_in_eltwise
    } else {
        1.0
    };

    let output_shift_scale = per_channel(count, options, |i| {
        output_shift(calib.scale_in, calib.weight_scale(i), routing.scale_out_data)
    });

    let bias_scale = config
        .has_bias()
        .then(|| per_channel(count, options, |i| calib.scale_in * calib.weight_scale(i)));

    log::trace!(
        "Derived {count} output scales (sum {sum_scale}, activation {})",
        routing.activation_scale
    );

    Ok(DerivedScales {
        output_shift_scale,
        sum_scale,
        activation_scale: routing.activation_scale,
        bias_scale,
    })
}

/// Derive only the bias scales of a convolution, whether or not it declares a bias.
pub fn bias_scales(
    calib: &CalibrationScales,
    config: &QuantizationConfig,
    options: DerivationOptions,
) -> Result<Vec<f32>, ScaleError> {
    let count = validate_weights(calib, config)?;

    Ok(per_channel(count, options, |i| {
        calib.scale_in * calib.weight_scale(i)
    }))
}

fn output_shift(scale_in: f32, scale_weight: f32, scale_out_data: f32) -> f32 {
    // Some calibrated models have all-zero channels, their scale can't be computed.
    if scale_weight == 0.0 {
        return scale_out_data;
    }

    (scale_out_data as f64 / (scale_in as f64 * scale_weight as f64)) as f32
}

fn per_channel<F>(count: usize, options: DerivationOptions, scale: F) -> Vec<f32>
where
    F: Fn(usize) -> f32 + Sync + Send,
{
    if count > options.parallel_threshold {
        (0..count).into_par_iter().map(scale).collect()
    } else {
        (0..count).map(scale).collect()
    }
}

fn validate(calib: &CalibrationScales, config: &QuantizationConfig) -> Result<usize, ScaleError> {
    if !config.force_fp32_output() && !calib.scale_out_is_set {
        return Err(ScaleError::missing("Scale_out"));
    }

    validate_weights(calib, config)
}

fn validate_weights(
    calib: &CalibrationScales,
    config: &QuantizationConfig,
) -> Result<usize, ScaleError> {
    if calib.scale_weights.is_empty() {
        return Err(ScaleError::missing("Scale_weights"));
    }

    let count = channel_count(calib, config);
    if calib.scale_weights.len() != 1 && calib.scale_weights.len() < count {
        return Err(ScaleError::invalid(format!(
            "{} weight scales provided for {count} output channels",
            calib.scale_weights.len()
        )));
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(groups: u32, shape: &[i64]) -> QuantizationConfig {
        QuantizationConfig::new(groups, shape.to_vec()).unwrap()
    }

    #[test]
    fn channel_count_single_group() {
        let calib = CalibrationScales::new(1.0, vec![0.1; 8], 1.0);

        assert_eq!(channel_count(&calib, &config(1, &[8, 3, 3, 3])), 8);
    }

    #[test]
    fn channel_count_grouped() {
        let calib = CalibrationScales::new(1.0, vec![0.1; 16], 1.0);

        assert_eq!(channel_count(&calib, &config(4, &[8, 2, 3, 3])), 16);
    }

    #[test]
    fn channel_count_global_scale() {
        let calib = CalibrationScales::new(1.0, vec![0.1], 1.0);

        assert_eq!(channel_count(&calib, &config(4, &[8, 2, 3, 3])), 1);
    }

    #[test]
    fn scalar_weight_scale_is_broadcast() {
        let calib = CalibrationScales::new(0.5, vec![0.25], 2.0);
        let config = config(1, &[8, 3, 3, 3]).with_bias(true);

        let scales = derive(&calib, &config).unwrap();

        assert_eq!(scales.output_shift_scale, vec![16.0]);
        assert_eq!(scales.bias_scale, Some(vec![0.125]));
    }

    #[test]
    fn division_is_exact_for_representable_values() {
        let calib = CalibrationScales::new(2.0, vec![0.5], 1.0);

        let scales = derive(&calib, &config(1, &[1, 1, 1, 1])).unwrap();

        assert_eq!(scales.output_shift_scale, vec![1.0]);
        assert_eq!(scales.activation_scale, 1.0);
        assert_eq!(scales.sum_scale, 1.0);
        assert_eq!(scales.bias_scale, None);
    }

    #[test]
    fn division_happens_in_double_precision() {
        let (scale_in, scale_weight, scale_out) = (0.1f32, 0.3f32, 0.7f32);
        let calib = CalibrationScales::new(scale_in, vec![scale_weight, scale_weight], scale_out);

        let scales = derive(&calib, &config(1, &[2, 1, 1, 1])).unwrap();
        let expected =
            (scale_out as f64 / (scale_in as f64 * scale_weight as f64)) as f32;

        assert_eq!(scales.output_shift_scale[0].to_bits(), expected.to_bits());
    }

    #[test]
    fn zero_weight_scale_falls_back_to_output_scale() {
        let calib = CalibrationScales::new(1.0, vec![0.0, 0.3], 2.0);

        let scales = derive(&calib, &config(1, &[2, 3, 3, 3])).unwrap();

        assert_eq!(
            scales.output_shift_scale,
            vec![2.0, (2.0f64 / (1.0f64 * 0.3f32 as f64)) as f32]
        );
    }

    #[test]
    fn activation_carries_output_scale() {
        let calib = CalibrationScales::new(2.0, vec![0.5], 3.0);
        let config = config(1, &[1, 1, 1, 1]).with_activation(Some("relu"));

        let scales = derive(&calib, &config).unwrap();

        assert_eq!(scales.activation_scale, 3.0);
        assert_eq!(scales.output_shift_scale, vec![1.0]);
    }

    #[test]
    fn force_fp32_output_ignores_output_scale() {
        let calib = CalibrationScales::new(2.0, vec![0.5], 3.0).without_scale_out();
        let config = config(1, &[1, 1, 1, 1])
            .with_force_fp32_output(true)
            .with_activation(Some("relu"));

        let scales = derive(&calib, &config).unwrap();

        assert_eq!(scales.activation_scale, 1.0);
        assert_eq!(scales.output_shift_scale, vec![1.0]);
    }

    #[test]
    fn residual_sum_scale() {
        let calib = CalibrationScales::new(1.0, vec![1.0], 4.0).with_scale_in_eltwise(2.0);

        let fused = derive(&calib, &config(1, &[1, 1, 1, 1]).with_fuse_residual(true)).unwrap();
        let unfused = derive(&calib, &config(1, &[1, 1, 1, 1])).unwrap();

        assert_eq!(fused.sum_scale, 2.0);
        assert_eq!(unfused.sum_scale, 1.0);
    }

    #[test]
    fn missing_output_scale_is_fatal() {
        let calib = CalibrationScales::new(1.0, vec![1.0], 1.0).without_scale_out();

        let err = derive(&calib, &config(1, &[1, 1, 1, 1])).unwrap_err();

        assert_eq!(
            err,
            ScaleError::MissingScaleAttribute {
                name: "Scale_out".to_string()
            }
        );
    }

    #[test]
    fn missing_eltwise_scale_is_fatal() {
        let calib = CalibrationScales::new(1.0, vec![1.0], 1.0);
        let config = config(1, &[1, 1, 1, 1]).with_fuse_residual(true);

        assert!(matches!(
            derive(&calib, &config),
            Err(ScaleError::MissingScaleAttribute { .. })
        ));
    }

    #[test]
    fn too_few_weight_scales() {
        let calib = CalibrationScales::new(1.0, vec![1.0, 2.0], 1.0);

        assert!(matches!(
            derive(&calib, &config(1, &[4, 1, 1, 1])),
            Err(ScaleError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let weights: Vec<f32> = (0..128).map(|i| (i % 7) as f32 * 0.013).collect();
        let calib = CalibrationScales::new(0.017, weights, 0.29);
        let config = config(1, &[128, 4, 3, 3]).with_bias(true);

        let parallel = derive_with(
            &calib,
            &config,
            DerivationOptions {
                parallel_threshold: 0,
            },
        )
        .unwrap();
        let sequential = derive_with(
            &calib,
            &config,
            DerivationOptions {
                parallel_threshold: usize::MAX,
            },
        )
        .unwrap();

        assert_eq!(parallel, sequential);
        assert_eq!(derive(&calib, &config).unwrap(), parallel);
    }

    #[test]
    fn masks() {
        let global = CalibrationScales::new(1.0, vec![1.0], 1.0);
        let per_channel = CalibrationScales::new(1.0, vec![1.0; 16], 1.0);

        assert_eq!(scale_mask(&global.scale_weights), 0);
        assert_eq!(scale_mask(&per_channel.scale_weights), 1);
        assert_eq!(grouped_scale_mask(&global, &config(4, &[8, 2, 3, 3])), 0);
        assert_eq!(grouped_scale_mask(&per_channel, &config(1, &[16, 2, 3, 3])), 1);
        assert_eq!(grouped_scale_mask(&per_channel, &config(4, &[8, 2, 3, 3])), 3);
        assert_eq!(output_scale_mask(&[1.0]), 0);
        assert_eq!(output_scale_mask(&[1.0, 2.0]), 2);
    }
}
