use super::activation::Activation;
use crate::ConvError;
use convq_runtime::{
    cache::ScaleTuple,
    memory::{Buffer, DataType, Format, Memory, MemoryDesc},
};
use core::ops::{AddAssign, Mul};

/// Operation applied to the convolution result before it's written.
#[derive(Clone, Debug, PartialEq)]
pub enum PostOp {
    /// Add the previous content of the destination multiplied by `scale`.
    Sum { scale: f32 },
    /// Apply an activation and multiply its result by `scale`.
    Eltwise {
        activation: Activation,
        alpha: f32,
        beta: f32,
        scale: f32,
    },
}

/// Attributes of a convolution primitive: output scales and post-ops.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrimitiveAttr {
    output_scales: Option<ScaleTuple>,
    post_ops: Vec<PostOp>,
}

impl PrimitiveAttr {
    /// Scale the accumulator of every output channel, `mask` being `0` for a single global scale
    /// or `1 << 1` for one scale per destination channel.
    pub fn set_output_scales(&mut self, mask: i32, scales: Vec<f32>) {
        self.output_scales = Some(ScaleTuple::new(mask, scales));
    }

    pub fn append_sum(&mut self, scale: f32) {
        self.post_ops.push(PostOp::Sum { scale });
    }

    pub fn append_eltwise(&mut self, scale: f32, activation: Activation, alpha: f32, beta: f32) {
        self.post_ops.push(PostOp::Eltwise {
            activation,
            alpha,
            beta,
            scale,
        });
    }

    pub fn output_scales(&self) -> Option<&ScaleTuple> {
        self.output_scales.as_ref()
    }

    pub fn post_ops(&self) -> &[PostOp] {
        &self.post_ops
    }

    fn has_sum(&self) -> bool {
        self.post_ops
            .iter()
            .any(|op| matches!(op, PostOp::Sum { .. }))
    }
}

/// Shapes, types and geometry of a 2-D transposed convolution.
///
/// Descriptors may use [Format::Any], the primitive then picks the plain layout. Weights are
/// `[o, i, kh, kw]`, or `[g, o, i, kh, kw]` for grouped convolutions, and dilations follow the
/// engine convention where `0` means no dilation.
#[derive(Clone, Debug, PartialEq)]
pub struct DeconvolutionDesc {
    pub src: MemoryDesc,
    pub weights: MemoryDesc,
    pub bias: Option<MemoryDesc>,
    pub dst: MemoryDesc,
    pub strides: Vec<i64>,
    pub dilations: Vec<i64>,
    pub padding_l: Vec<i64>,
    pub padding_r: Vec<i64>,
}

/// Spatial size of a transposed convolution output.
pub fn output_size(
    input: i64,
    kernel: i64,
    stride: i64,
    dilation: i64,
    pad_l: i64,
    pad_r: i64,
) -> i64 {
    (input - 1) * stride - pad_l - pad_r + (dilation + 1) * (kernel - 1) + 1
}

#[derive(Clone, Copy, Debug)]
struct Geometry {
    batch: usize,
    groups: usize,
    in_per_group: usize,
    out_per_group: usize,
    in_size: [usize; 2],
    out_size: [usize; 2],
    kernel: [usize; 2],
    stride: [i64; 2],
    dilation: [i64; 2],
    padding: [i64; 2],
}

impl Geometry {
    fn channels_out(&self) -> usize {
        self.groups * self.out_per_group
    }

    fn channels_in(&self) -> usize {
        self.groups * self.in_per_group
    }
}

/// Reference transposed convolution.
///
/// Int8 sources are multiplied with `s8` weights and accumulated in `i32`, the accumulator of
/// each channel then gets the bias, the output scales and the post-ops in order, and is
/// converted to the destination type with rounding and saturation.
#[derive(Debug)]
pub struct Deconvolution {
    desc: DeconvolutionDesc,
    attr: PrimitiveAttr,
    geometry: Geometry,
}

impl Deconvolution {
    pub fn new(desc: DeconvolutionDesc, attr: PrimitiveAttr) -> Result<Self, ConvError> {
        let desc = DeconvolutionDesc {
            src: resolve(&desc.src, Format::Nchw),
            weights: resolve(
                &desc.weights,
                if desc.weights.dims().len() == 5 {
                    Format::Goihw
                } else {
                    Format::Oihw
                },
            ),
            bias: desc.bias.as_ref().map(|bias| resolve(bias, Format::X)),
            dst: resolve(&desc.dst, Format::Nchw),
            ..desc
        };
        let geometry = geometry(&desc)?;

        if desc.src.dtype().is_int8() && desc.weights.dtype() != DataType::S8 {
            return Err(ConvError::invalid(format!(
                "int8 sources need s8 weights, got {:?}",
                desc.weights.dtype()
            )));
        }

        if let Some(scales) = attr.output_scales() {
            let required = match scales.mask {
                0 => 1,
                mask if mask == 1 << 1 => geometry.channels_out(),
                mask => {
                    return Err(ConvError::invalid(format!(
                        "output scales mask {mask:#b} isn't supported"
                    )))
                }
            };
            if scales.values.len() < required {
                return Err(ConvError::invalid(format!(
                    "{} output scales provided for {} output channels",
                    scales.values.len(),
                    geometry.channels_out()
                )));
            }
        }

        Ok(Self {
            desc,
            attr,
            geometry,
        })
    }

    pub fn src_desc(&self) -> &MemoryDesc {
        &self.desc.src
    }

    pub fn weights_desc(&self) -> &MemoryDesc {
        &self.desc.weights
    }

    pub fn bias_desc(&self) -> Option<&MemoryDesc> {
        self.desc.bias.as_ref()
    }

    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.desc.dst
    }

    pub fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    /// Run the convolution. `residual` is the destination content consumed by a sum post-op.
    pub fn execute(
        &self,
        src: &Memory,
        weights: &Memory,
        bias: Option<&Memory>,
        residual: Option<&[f32]>,
    ) -> Result<Buffer, ConvError> {
        check_desc("source", src.desc(), &self.desc.src)?;
        check_desc("weights", weights.desc(), &self.desc.weights)?;
        match (bias, &self.desc.bias) {
            (Some(bias), Some(expected)) => check_desc("bias", bias.desc(), expected)?,
            (None, None) => {}
            _ => {
                return Err(ConvError::invalid(
                    "bias memory must be given exactly when the primitive has a bias",
                ))
            }
        }

        let num_elements = self.desc.dst.num_elements();
        let residual: &[f32] = match (self.attr.has_sum(), residual) {
            (true, Some(residual)) if residual.len() == num_elements => residual,
            (true, _) => {
                return Err(ConvError::invalid(format!(
                    "a sum post-op needs {num_elements} residual values"
                )))
            }
            (false, _) => &[],
        };

        let src_data = src.data();
        let weights_data = weights.data();
        let accumulator: Vec<f32> = match (src_data.to_i32(), weights_data.to_i32()) {
            (Some(src), Some(weights)) => self
                .accumulate(&src, &weights)
                .into_iter()
                .map(|acc| acc as f32)
                .collect(),
            _ => self.accumulate(&src_data.to_f32(), &weights_data.to_f32()),
        };
        let bias = bias.map(|bias| bias.data().to_f32());

        let plane = self.geometry.out_size[0] * self.geometry.out_size[1];
        let channels = self.geometry.channels_out();
        let values: Vec<f32> = accumulator
            .into_iter()
            .enumerate()
            .map(|(index, acc)| {
                let channel = (index / plane) % channels;
                let mut value = acc + bias.as_ref().map_or(0.0, |bias| bias[channel]);

                if let Some(scales) = self.attr.output_scales() {
                    value *= match scales.mask {
                        0 => scales.values[0],
                        _ => scales.values[channel],
                    };
                }

                for op in self.attr.post_ops() {
                    value = match op {
                        PostOp::Sum { scale } => value + scale * residual[index],
                        PostOp::Eltwise {
                            activation,
                            alpha,
                            beta,
                            scale,
                        } => scale * activation.apply(value, *alpha, *beta),
                    };
                }
                value
            })
            .collect();

        Ok(Buffer::from_f32(self.desc.dst.dtype(), &values))
    }

    fn accumulate<T>(&self, src: &[T], weights: &[T]) -> Vec<T>
    where
        T: Copy + Default + AddAssign + Mul<Output = T>,
    {
        let g = self.geometry;
        let [in_h, in_w] = g.in_size;
        let [out_h, out_w] = g.out_size;
        let [k_h, k_w] = g.kernel;
        let mut acc = vec![T::default(); g.batch * g.channels_out() * out_h * out_w];

        for n in 0..g.batch {
            for group in 0..g.groups {
                for oc in 0..g.out_per_group {
                    let dst_channel = n * g.channels_out() + group * g.out_per_group + oc;
                    let dst_base = dst_channel * out_h * out_w;
                    for ic in 0..g.in_per_group {
                        let src_channel = n * g.channels_in() + group * g.in_per_group + ic;
                        let src_base = src_channel * in_h * in_w;
                        let filter = (group * g.out_per_group + oc) * g.in_per_group + ic;
                        let weights_base = filter * k_h * k_w;

                        for iy in 0..in_h {
                            for ix in 0..in_w {
                                let value = src[src_base + iy * in_w + ix];
                                for ky in 0..k_h {
                                    let Some(oy) = position(iy, ky, 0, &g, out_h) else {
                                        continue;
                                    };
                                    for kx in 0..k_w {
                                        let Some(ox) = position(ix, kx, 1, &g, out_w) else {
                                            continue;
                                        };
                                        acc[dst_base + oy * out_w + ox] +=
                                            value * weights[weights_base + ky * k_w + kx];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        acc
    }
}

/// Output coordinate reached by an input coordinate through a kernel tap, if inside the output.
fn position(input: usize, kernel: usize, axis: usize, g: &Geometry, size: usize) -> Option<usize> {
    let pos = input as i64 * g.stride[axis] - g.padding[axis]
        + kernel as i64 * (g.dilation[axis] + 1);
    (0..size as i64).contains(&pos).then_some(pos as usize)
}

fn resolve(desc: &MemoryDesc, plain: Format) -> MemoryDesc {
    if desc.format() == Format::Any {
        // Dimensions were validated when the descriptor was created.
        MemoryDesc::new(desc.dims().to_vec(), desc.dtype(), plain)
            .unwrap_or_else(|_| desc.clone())
    } else {
        desc.clone()
    }
}

fn check_desc(name: &str, actual: &MemoryDesc, expected: &MemoryDesc) -> Result<(), ConvError> {
    if actual != expected {
        return Err(ConvError::invalid(format!(
            "{name} memory {actual:?} doesn't match the primitive descriptor {expected:?}"
        )));
    }
    Ok(())
}

fn geometry(desc: &DeconvolutionDesc) -> Result<Geometry, ConvError> {
    for (name, memory, formats) in [
        ("source", &desc.src, &[Format::Nchw][..]),
        ("weights", &desc.weights, &[Format::Oihw, Format::Goihw][..]),
        ("destination", &desc.dst, &[Format::Nchw][..]),
    ] {
        if !formats.contains(&memory.format()) {
            return Err(ConvError::invalid(format!(
                "{name} must be laid out as one of {formats:?}, got {:?}",
                memory.format()
            )));
        }
    }
    if desc.strides.len() != 2
        || desc.dilations.len() != 2
        || desc.padding_l.len() != 2
        || desc.padding_r.len() != 2
    {
        return Err(ConvError::unimplemented(
            "only 2-D transposed convolutions are supported",
        ));
    }

    let src = desc.src.dims();
    let dst = desc.dst.dims();
    let weights = desc.weights.dims();
    let (groups, w) = match weights.len() {
        5 => (weights[0], &weights[1..]),
        _ => (1, weights),
    };

    let geometry = Geometry {
        batch: src[0] as usize,
        groups: groups as usize,
        out_per_group: w[0] as usize,
        in_per_group: w[1] as usize,
        in_size: [src[2] as usize, src[3] as usize],
        out_size: [dst[2] as usize, dst[3] as usize],
        kernel: [w[2] as usize, w[3] as usize],
        stride: [desc.strides[0], desc.strides[1]],
        dilation: [desc.dilations[0], desc.dilations[1]],
        padding: [desc.padding_l[0], desc.padding_l[1]],
    };

    let expected_dst: Vec<i64> = (0..2)
        .map(|axis| {
            output_size(
                src[axis + 2],
                w[axis + 2],
                desc.strides[axis],
                desc.dilations[axis],
                desc.padding_l[axis],
                desc.padding_r[axis],
            )
        })
        .collect();
    if src[1] as usize != geometry.channels_in()
        || dst[0] != src[0]
        || dst[1] as usize != geometry.channels_out()
        || dst[2..] != expected_dst[..]
    {
        return Err(ConvError::invalid(format!(
            "source {src:?}, weights {weights:?} and destination {dst:?} are inconsistent"
        )));
    }
    if let Some(bias) = &desc.bias {
        if bias.dims() != [geometry.channels_out() as i64] {
            return Err(ConvError::invalid(format!(
                "bias {:?} must have one value per output channel",
                bias.dims()
            )));
        }
    }

    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn desc(dims: &[i64], dtype: DataType) -> MemoryDesc {
        MemoryDesc::new(dims.to_vec(), dtype, Format::Any).unwrap()
    }

    fn deconv(
        dtype: DataType,
        weights_dtype: DataType,
        dst: DataType,
        attr: PrimitiveAttr,
    ) -> Deconvolution {
        Deconvolution::new(
            DeconvolutionDesc {
                src: desc(&[1, 1, 2, 2], dtype),
                weights: desc(&[1, 1, 2, 2], weights_dtype),
                bias: None,
                dst: desc(&[1, 1, 3, 3], dst),
                strides: vec![1, 1],
                dilations: vec![0, 0],
                padding_l: vec![0, 0],
                padding_r: vec![0, 0],
            },
            attr,
        )
        .unwrap()
    }

    fn memory(desc: &MemoryDesc, data: Buffer) -> Memory {
        Memory::new(desc.clone(), Arc::new(data)).unwrap()
    }

    #[test]
    fn output_size_formula() {
        assert_eq!(output_size(2, 2, 1, 0, 0, 0), 3);
        assert_eq!(output_size(3, 3, 2, 0, 1, 1), 5);
        assert_eq!(output_size(3, 3, 1, 1, 0, 0), 7);
    }

    #[test]
    fn scatters_source_over_kernel() {
        let attr = PrimitiveAttr::default();
        let primitive = deconv(DataType::F32, DataType::F32, DataType::F32, attr);
        let src = memory(primitive.src_desc(), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]));
        let weights = memory(primitive.weights_desc(), Buffer::F32(vec![1.0, 1.0, 1.0, 1.0]));

        let dst = primitive.execute(&src, &weights, None, None).unwrap();

        assert_eq!(
            dst,
            Buffer::F32(vec![1.0, 3.0, 2.0, 4.0, 10.0, 6.0, 3.0, 7.0, 4.0])
        );
    }

    #[test]
    fn int8_accumulates_then_scales() {
        let mut attr = PrimitiveAttr::default();
        attr.set_output_scales(0, vec![0.5]);
        attr.append_eltwise(1.0, Activation::Relu, 0.0, 0.0);
        let primitive = deconv(DataType::U8, DataType::S8, DataType::U8, attr);
        let src = memory(primitive.src_desc(), Buffer::U8(vec![10, 20, 30, 40]));
        let weights = memory(primitive.weights_desc(), Buffer::S8(vec![1, -1, 0, 2]));

        let dst = primitive.execute(&src, &weights, None, None).unwrap();

        // Accumulators [10, 10, -20, 30, 30, 0, 0, 60, 80] halved, negatives clamped.
        assert_eq!(dst, Buffer::U8(vec![5, 5, 0, 15, 15, 0, 0, 30, 40]));
    }

    #[test]
    fn sum_needs_residual() {
        let mut attr = PrimitiveAttr::default();
        attr.append_sum(1.0);
        let primitive = deconv(DataType::F32, DataType::F32, DataType::F32, attr);
        let src = memory(primitive.src_desc(), Buffer::F32(vec![0.0; 4]));
        let weights = memory(primitive.weights_desc(), Buffer::F32(vec![0.0; 4]));

        assert!(primitive.execute(&src, &weights, None, None).is_err());
        assert_eq!(
            primitive
                .execute(&src, &weights, None, Some(&[2.0; 9]))
                .unwrap(),
            Buffer::F32(vec![2.0; 9])
        );
    }

    #[test]
    fn rejects_missing_channel_scales() {
        let mut attr = PrimitiveAttr::default();
        attr.set_output_scales(1 << 1, vec![]);

        let result = Deconvolution::new(
            DeconvolutionDesc {
                src: desc(&[1, 1, 2, 2], DataType::S8),
                weights: desc(&[1, 1, 2, 2], DataType::S8),
                bias: None,
                dst: desc(&[1, 1, 3, 3], DataType::F32),
                strides: vec![1, 1],
                dilations: vec![0, 0],
                padding_l: vec![0, 0],
                padding_r: vec![0, 0],
            },
            attr,
        );

        assert!(result.is_err());
    }
}
