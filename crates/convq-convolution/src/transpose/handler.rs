use super::{
    activation::Activation,
    padding::{resolve_padding, PaddingAlgorithm},
    primitive::{output_size, Deconvolution, DeconvolutionDesc, PrimitiveAttr},
    ConvTransposeArgs,
};
use crate::{
    attribute::OpDesc,
    scales::OpQuantization,
    tensor::{DataLayout, Tensor},
    ConvError,
};
use convq_quant::{derive_with, output_scale_mask, DerivedScales, ScaleError};
use convq_runtime::{
    cache::{ArtifactKind, CacheKey, OperatorKey, ReorderRequest, Slot},
    memory::{Buffer, DataType, Format, Memory, MemoryDesc},
    reorder::ReorderAttr,
    ExecutionContext,
};
use std::sync::Arc;

/// Weights dimensions expected by the primitive for a filter stored `[i, o, kh, kw]`.
///
/// Grouped filters are split to `[g, i / g, o, kh, kw]` first, input and output channels are
/// then swapped.
pub fn weights_tz(filter_dims: &[i64], groups: i64) -> Result<Vec<i64>, ConvError> {
    let mut tz = filter_dims.to_vec();
    let g_dim = if groups > 1 {
        if tz[0] % groups != 0 {
            return Err(ConvError::invalid(format!(
                "{} input channels can't be split in {groups} groups",
                tz[0]
            )));
        }
        tz[0] /= groups;
        tz.insert(0, groups);
        1
    } else {
        0
    };

    tz.swap(g_dim, g_dim + 1);
    Ok(tz)
}

/// Element type of the destination.
///
/// Int8 convolutions write `u8` when the fused activation can't produce negative values and `s8`
/// otherwise. Float convolutions write `bf16` on the bfloat16 path. A forced fp32 output wins
/// over both.
pub fn dst_type(
    is_int8: bool,
    is_bf16: bool,
    force_fp32_output: bool,
    activation: Option<Activation>,
) -> DataType {
    if force_fp32_output {
        return DataType::F32;
    }

    match (is_int8, activation) {
        (true, Some(activation)) if activation.is_unsigned() => DataType::U8,
        (true, _) => DataType::S8,
        (false, _) if is_bf16 => DataType::Bf16,
        (false, _) => DataType::F32,
    }
}

/// Validates a transposed convolution, builds its primitive and fetches its operand memories
/// through the context cache.
pub(crate) struct ConvTransposeHandler<'a> {
    ctx: &'a ExecutionContext,
    op: &'a OpDesc,
    key: OperatorKey,
    groups: i64,
    is_test: bool,
    weights_tz: Vec<i64>,
    primitive: Deconvolution,
}

impl<'a> ConvTransposeHandler<'a> {
    pub fn new(
        ctx: &'a ExecutionContext,
        op: &'a OpDesc,
        key: OperatorKey,
        args: &ConvTransposeArgs<'_>,
        is_int8: bool,
        is_bf16: bool,
        dst_dtype: DataType,
    ) -> Result<Self, ConvError> {
        let is_test = op.get_attr_if_exists::<bool>("is_test")?;
        if !is_test {
            return Err(ConvError::invalid(
                "transposed convolution works only for inference, is_test must be true",
            ));
        }

        let (input, filter) = (args.input, args.filter);
        if input.layout() != DataLayout::Engine {
            return Err(ConvError::invalid(format!(
                "wrong layout {:?} for the input tensor",
                input.layout()
            )));
        }
        if filter.layout() != DataLayout::Engine {
            return Err(ConvError::invalid(format!(
                "the filter layout should be {:?}, got {:?}",
                DataLayout::Engine,
                filter.layout()
            )));
        }
        if input.dims().len() != 4 {
            return Err(ConvError::invalid(format!(
                "input must have 4 dimensions, i.e. NCHW, got {:?}",
                input.dims()
            )));
        }
        if filter.dims().len() != 4 {
            return Err(ConvError::invalid(format!(
                "filter must have 4 dimensions, i.e. IOHW, got {:?}",
                filter.dims()
            )));
        }
        if let Some(bias) = args.bias {
            if bias.layout() != DataLayout::Engine {
                return Err(ConvError::invalid(format!(
                    "the bias layout should be {:?}, got {:?}",
                    DataLayout::Engine,
                    bias.layout()
                )));
            }
            if bias.dims().len() != 1 {
                return Err(ConvError::invalid(format!(
                    "bias must have 1 dimension, got {:?}",
                    bias.dims()
                )));
            }
        }

        let strides = ints(op, "strides", &[1, 1])?;
        let paddings = ints(op, "paddings", &[0, 0])?;
        let dilations = ints(op, "dilations", &[1, 1])?;
        let groups = op.get_attr_if_exists::<i32>("groups")?.max(1) as i64;
        let algorithm =
            PaddingAlgorithm::parse(&op.get_attr_if_exists::<String>("padding_algorithm")?)?;

        if strides.len() != 2 {
            return Err(ConvError::unimplemented(
                "only 2-D transposed convolutions are supported",
            ));
        }

        let data_dims = &input.dims()[2..];
        let ksize = &filter.dims()[2..];
        let padding = resolve_padding(algorithm, &paddings, &dilations, data_dims, &strides, ksize)?;

        let weights_tz = weights_tz(filter.dims(), groups)?;
        let mut dst_tz = vec![input.dims()[0], filter.dims()[1] * groups];
        for axis in 0..2 {
            let size = output_size(
                data_dims[axis],
                ksize[axis],
                strides[axis],
                padding.dilations[axis],
                padding.padding_l[axis],
                padding.padding_r[axis],
            );
            if size <= 0 {
                return Err(ConvError::invalid(format!(
                    "input {:?} produces an empty output",
                    input.dims()
                )));
            }
            dst_tz.push(size);
        }

        let (src_dtype, weights_dtype, bias_dtype) = match (is_int8, is_bf16) {
            (true, _) => (input.dtype(), DataType::S8, DataType::S32),
            (false, true) => (DataType::Bf16, DataType::Bf16, DataType::Bf16),
            (false, false) => (DataType::F32, DataType::F32, DataType::F32),
        };

        let bias = match args.bias {
            Some(bias) => Some(MemoryDesc::new(bias.dims().to_vec(), bias_dtype, Format::X)?),
            None => None,
        };
        let desc = DeconvolutionDesc {
            src: MemoryDesc::new(input.dims().to_vec(), src_dtype, Format::Any)?,
            weights: MemoryDesc::new(weights_tz.clone(), weights_dtype, Format::Any)?,
            bias,
            dst: MemoryDesc::new(dst_tz, dst_dtype, Format::Any)?,
            strides,
            dilations: padding.dilations,
            padding_l: padding.padding_l,
            padding_r: padding.padding_r,
        };

        let attr = create_conv_attrs(ctx, op, &key, is_int8, filter.dims(), args.bias.is_some())?;

        Ok(Self {
            ctx,
            op,
            key,
            groups,
            is_test,
            weights_tz,
            primitive: Deconvolution::new(desc, attr)?,
        })
    }

    pub fn key(&self) -> &OperatorKey {
        &self.key
    }

    pub fn primitive(&self) -> &Deconvolution {
        &self.primitive
    }

    pub fn cache_key(&self, kind: ArtifactKind) -> CacheKey {
        CacheKey::new(self.key.clone(), self.ctx.stream(), kind)
    }

    /// Calibration read from the operator, for scales not precomputed by the graph pass.
    pub fn quantization(
        &self,
        filter_dims: &[i64],
        has_bias: bool,
    ) -> Result<OpQuantization, ConvError> {
        OpQuantization::from_op(self.op, filter_dims, has_bias)
    }

    /// The source in the layout of the primitive, reordered on every call.
    ///
    /// Batch and spatial sizes may change between calls, so nothing is cached.
    pub fn acquire_src_memory(&self, input: &Tensor) -> Result<Arc<Memory>, ConvError> {
        let user = MemoryDesc::new(input.dims().to_vec(), input.dtype(), Format::Nchw)?;
        let request =
            self.request(Slot::Source, user, input.data(), false, ReorderAttr::default())?;

        Ok(self.ctx.cache().reorder_uncached(request)?)
    }

    /// The weights in the layout of the primitive, reordered on the first call only.
    pub fn acquire_weights_memory(
        &self,
        filter: &Tensor,
        scales: ReorderAttr,
    ) -> Result<Arc<Memory>, ConvError> {
        let format = if self.groups == 1 {
            Format::Iohw
        } else {
            Format::Giohw
        };
        let user = MemoryDesc::new(self.weights_tz.clone(), filter.dtype(), format)?;
        self.acquire(Slot::Weights, user, filter.data(), self.is_test, scales)
    }

    /// The bias in the layout of the primitive, reordered on the first call only.
    pub fn acquire_bias_memory(
        &self,
        bias: &Tensor,
        scales: ReorderAttr,
    ) -> Result<Arc<Memory>, ConvError> {
        let user = MemoryDesc::new(bias.dims().to_vec(), bias.dtype(), Format::X)?;
        self.acquire(Slot::Bias, user, bias.data(), self.is_test, scales)
    }

    fn acquire(
        &self,
        slot: Slot,
        user: MemoryDesc,
        data: Arc<Buffer>,
        persistent: bool,
        scales: ReorderAttr,
    ) -> Result<Arc<Memory>, ConvError> {
        let request = self.request(slot, user, data, persistent, scales)?;

        Ok(self.ctx.cache().get_or_reorder(request)?)
    }

    fn request(
        &self,
        slot: Slot,
        user: MemoryDesc,
        data: Arc<Buffer>,
        persistent: bool,
        scales: ReorderAttr,
    ) -> Result<ReorderRequest<'_>, ConvError> {
        let target = match slot {
            Slot::Source => self.primitive.src_desc(),
            Slot::Weights => self.primitive.weights_desc(),
            Slot::Bias => self.primitive.bias_desc().ok_or_else(|| {
                ConvError::invalid("bias given to a primitive created without bias")
            })?,
        };

        let request = ReorderRequest::new(
            &self.key,
            self.ctx.stream(),
            slot,
            user,
            target,
            data,
            persistent,
            scales,
        );

        Ok(request)
    }
}

/// Output scales and post-ops of the primitive.
///
/// Int8 convolutions use the scales attached by the graph pass, or derive them once per operator
/// and stream when the pass didn't run.
fn create_conv_attrs(
    ctx: &ExecutionContext,
    op: &OpDesc,
    key: &OperatorKey,
    is_int8: bool,
    filter_dims: &[i64],
    has_bias: bool,
) -> Result<PrimitiveAttr, ConvError> {
    let mut attr = PrimitiveAttr::default();
    let mut sum_scale = 1.0;
    let mut activation_scale = 1.0;

    if is_int8 {
        let scales = if op.has_attr("Sum_scale") {
            Arc::new(precomputed_scales(op)?)
        } else {
            log::debug!("Deriving int8 scales of {key} at inference time");
            let options = ctx.derivation_options();
            let cache_key = CacheKey::new(key.clone(), ctx.stream(), ArtifactKind::DerivedScales);

            ctx.cache().get_or_compute(cache_key, || {
                let params = OpQuantization::from_op(op, filter_dims, has_bias)?;
                Ok::<_, ConvError>(derive_with(&params.calib, &params.config, options)?)
            })?
        };

        sum_scale = scales.sum_scale;
        activation_scale = scales.activation_scale;
        if !scales.output_shift_scale.is_empty() {
            attr.set_output_scales(
                output_scale_mask(&scales.output_shift_scale),
                scales.output_shift_scale.clone(),
            );
        }
    }

    if op.get_attr_if_exists::<bool>("fuse_residual_connection")? {
        attr.append_sum(sum_scale);
    }

    let activation = op.get_attr_if_exists::<String>("fuse_activation")?;
    if let Some(activation) = Activation::parse(&activation)? {
        attr.append_eltwise(
            activation_scale,
            activation,
            op.get_attr_if_exists("fuse_alpha")?,
            op.get_attr_if_exists("fuse_beta")?,
        );
    }

    Ok(attr)
}

fn precomputed_scales(op: &OpDesc) -> Result<DerivedScales, ConvError> {
    let required = |name: &str| ScaleError::MissingScaleAttribute { name: name.into() };

    Ok(DerivedScales {
        output_shift_scale: op
            .attr::<Vec<f32>>("Output_shift_scale")?
            .ok_or_else(|| required("Output_shift_scale"))?,
        sum_scale: op.attr::<f32>("Sum_scale")?.ok_or_else(|| required("Sum_scale"))?,
        activation_scale: op
            .attr::<f32>("Activation_scale")?
            .ok_or_else(|| required("Activation_scale"))?,
        bias_scale: op.attr::<Vec<f32>>("Bias_scales")?,
    })
}

fn ints(op: &OpDesc, name: &str, default: &[i64]) -> Result<Vec<i64>, ConvError> {
    Ok(match op.attr::<Vec<i32>>(name)? {
        Some(values) => values.into_iter().map(i64::from).collect(),
        None => default.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_tz_swaps_channels() {
        assert_eq!(weights_tz(&[3, 5, 2, 2], 1).unwrap(), vec![5, 3, 2, 2]);
    }

    #[test]
    fn weights_tz_splits_groups() {
        assert_eq!(weights_tz(&[4, 3, 2, 2], 2).unwrap(), vec![2, 3, 2, 2, 2]);
        assert!(weights_tz(&[5, 3, 2, 2], 2).is_err());
    }

    #[test]
    fn dst_type_selection() {
        let relu = Some(Activation::Relu);
        let tanh = Some(Activation::Tanh);

        assert_eq!(dst_type(true, false, false, relu), DataType::U8);
        assert_eq!(dst_type(true, false, false, tanh), DataType::S8);
        assert_eq!(dst_type(true, false, false, None), DataType::S8);
        assert_eq!(dst_type(true, false, true, relu), DataType::F32);
        assert_eq!(dst_type(false, true, false, None), DataType::Bf16);
        assert_eq!(dst_type(false, true, true, None), DataType::F32);
        assert_eq!(dst_type(false, false, false, relu), DataType::F32);
    }
}
