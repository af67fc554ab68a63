use super::{
    activation::Activation,
    handler::{dst_type, ConvTransposeHandler},
};
use crate::{attribute::OpDesc, tensor::Tensor, ConvError};
use convq_quant::{bias_scales, grouped_scale_mask, scale_mask, ScaleError};
use convq_runtime::{
    cache::{ArtifactKind, OperatorKey, ScaleTuple},
    memory::{DataType, Memory},
    reorder::ReorderAttr,
    ExecutionContext,
};

/// Tensors consumed by a transposed convolution.
#[derive(new, Clone, Copy, Debug)]
pub struct ConvTransposeArgs<'a> {
    pub input: &'a Tensor,
    pub filter: &'a Tensor,
    #[new(default)]
    pub bias: Option<&'a Tensor>,
    /// Destination content added by a fused residual connection.
    #[new(default)]
    pub residual: Option<&'a Tensor>,
}

impl<'a> ConvTransposeArgs<'a> {
    pub fn with_bias(mut self, bias: &'a Tensor) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_residual(mut self, residual: &'a Tensor) -> Self {
        self.residual = Some(residual);
        self
    }
}

/// Run a `conv2d_transpose` operator.
///
/// Int8 inputs select the quantized path, everything else the float path. Operand memories and
/// scales are cached in `ctx` under the names of the operator inputs, so repeated calls only
/// reorder the source.
pub fn conv_transpose(
    ctx: &ExecutionContext,
    op: &OpDesc,
    args: ConvTransposeArgs<'_>,
) -> Result<Tensor, ConvError> {
    let is_int8 = args.input.dtype().is_int8();
    let is_bf16 = op.get_attr_if_exists::<String>("mkldnn_data_type")? == "bfloat16"
        || args.input.dtype() == DataType::Bf16;
    let activation = Activation::parse(&op.get_attr_if_exists::<String>("fuse_activation")?)?;
    let force_fp32_output = op.get_attr_if_exists::<bool>("force_fp32_output")?;
    let dst_dtype = dst_type(is_int8, is_bf16, force_fp32_output, activation);

    let key = operator_key(op, &args)?;
    log::debug!("Running {} {key} with a {dst_dtype:?} destination", op.op_type());

    if is_int8 {
        compute_int8(ctx, op, key, args, dst_dtype)
    } else {
        compute_fp32(ctx, op, key, args, is_bf16, dst_dtype)
    }
}

fn compute_fp32(
    ctx: &ExecutionContext,
    op: &OpDesc,
    key: OperatorKey,
    args: ConvTransposeArgs<'_>,
    is_bf16: bool,
    dst_dtype: DataType,
) -> Result<Tensor, ConvError> {
    let handler = ConvTransposeHandler::new(ctx, op, key, &args, false, is_bf16, dst_dtype)?;

    let src = handler.acquire_src_memory(args.input)?;
    let weights = handler.acquire_weights_memory(args.filter, ReorderAttr::default())?;
    let bias = match args.bias {
        Some(bias) => Some(handler.acquire_bias_memory(bias, ReorderAttr::default())?),
        None => None,
    };

    execute(&handler, op, &args, &src, &weights, bias.as_deref())
}

fn compute_int8(
    ctx: &ExecutionContext,
    op: &OpDesc,
    key: OperatorKey,
    args: ConvTransposeArgs<'_>,
    dst_dtype: DataType,
) -> Result<Tensor, ConvError> {
    if op.attr::<Vec<i32>>("strides")?.is_some_and(|strides| strides.len() == 3) {
        return Err(ConvError::unimplemented(
            "int8 transposed convolution doesn't support 3-D inputs",
        ));
    }

    let handler = ConvTransposeHandler::new(ctx, op, key, &args, true, false, dst_dtype)?;
    let filter_dims = args.filter.dims();
    let has_bias = args.bias.is_some();

    let src = handler.acquire_src_memory(args.input)?;

    // Float weights are quantized by their reorder, int8 weights are used as is.
    let weights_scales = if args.filter.dtype().is_int8() {
        ReorderAttr::default()
    } else {
        let params = handler.quantization(filter_dims, has_bias)?;
        ReorderAttr::new(
            grouped_scale_mask(&params.calib, &params.config),
            params.calib.scale_weights,
        )
    };
    let weights = handler.acquire_weights_memory(args.filter, weights_scales)?;

    let bias = match args.bias {
        Some(bias) => {
            let scales = ctx.cache().get_or_compute(
                handler.cache_key(ArtifactKind::BiasScales),
                || -> Result<ScaleTuple, ConvError> {
                    let values = match op.attr::<Vec<f32>>("Bias_scales")? {
                        Some(values) => values,
                        None => {
                            let params = handler.quantization(filter_dims, has_bias)?;
                            bias_scales(&params.calib, &params.config, ctx.derivation_options())?
                        }
                    };
                    if values.is_empty() {
                        return Err(ScaleError::MissingScaleAttribute {
                            name: "Bias_scales".into(),
                        }
                        .into());
                    }

                    Ok(ScaleTuple::new(scale_mask(&values), values))
                },
            )?;

            let attr = ReorderAttr::new(scales.mask, scales.values.clone());
            Some(handler.acquire_bias_memory(bias, attr)?)
        }
        None => None,
    };

    execute(&handler, op, &args, &src, &weights, bias.as_deref())
}

fn execute(
    handler: &ConvTransposeHandler<'_>,
    op: &OpDesc,
    args: &ConvTransposeArgs<'_>,
    src: &Memory,
    weights: &Memory,
    bias: Option<&Memory>,
) -> Result<Tensor, ConvError> {
    let primitive = handler.primitive();
    let dst_dims = primitive.dst_desc().dims().to_vec();

    let residual = if op.get_attr_if_exists::<bool>("fuse_residual_connection")? {
        let residual = args.residual.ok_or_else(|| {
            ConvError::invalid(format!(
                "{} fuses a residual connection but no residual data was given",
                handler.key()
            ))
        })?;
        if residual.dims() != dst_dims.as_slice() {
            return Err(ConvError::invalid(format!(
                "residual {:?} doesn't match the output {dst_dims:?}",
                residual.dims()
            )));
        }
        Some(residual.to_f32())
    } else {
        None
    };

    let output = primitive.execute(src, weights, bias, residual.as_deref())?;
    Tensor::new(dst_dims, output)
}

fn operator_key(op: &OpDesc, args: &ConvTransposeArgs<'_>) -> Result<OperatorKey, ConvError> {
    let name = |slot: &str| {
        op.input(slot).first().cloned().ok_or_else(|| {
            ConvError::invalid(format!("`{}` has no {slot} variable", op.op_type()))
        })
    };

    let bias = match args.bias {
        Some(_) => Some(name("Bias")?),
        None => None,
    };

    Ok(OperatorKey::new(name("Input")?, name("Filter")?, bias.as_deref()))
}
