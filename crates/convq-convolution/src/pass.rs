use crate::{
    attribute::OpDesc,
    graph::{Graph, VarDesc},
    scales::OpQuantization,
    ConvError,
};
use convq_quant::{derive_with, DerivationOptions};
use convq_runtime::config::{pass::PassLogLevel, GlobalConfig, Logger};
use hashbrown::HashMap;
use std::sync::Arc;

/// A rewrite applied to a whole graph.
pub trait GraphPass {
    /// Apply the pass, returning the number of rewritten operators.
    fn apply(&mut self, graph: &mut Graph) -> Result<usize, ConvError>;
}

/// Operator types matched by [ConvInt8ScalesPass].
pub const CONV_OP_TYPES: [&str; 3] = ["conv2d", "depthwise_conv2d", "conv2d_transpose"];

/// Precomputes the requantization scales of every int8 convolution and attaches them as the
/// `Output_shift_scale`, `Sum_scale`, `Activation_scale` and `Bias_scales` attributes, so kernels
/// don't have to derive them at inference time.
///
/// Operators failing the compatibility check are skipped with a warning. Missing calibration
/// attributes on an int8 convolution abort the pass.
pub struct ConvInt8ScalesPass {
    options: DerivationOptions,
    logger: Logger,
}

impl Default for ConvInt8ScalesPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvInt8ScalesPass {
    /// Create the pass using the global configuration.
    pub fn new() -> Self {
        Self::from_config(GlobalConfig::get())
    }

    /// Create the pass using an explicit configuration.
    pub fn from_config(config: Arc<GlobalConfig>) -> Self {
        Self {
            options: config.derivation.options(),
            logger: Logger::from_config(config),
        }
    }

    fn rewrite(&mut self, op: &mut OpDesc, filter: &VarDesc) -> Result<(), ConvError> {
        let has_bias = op.has_input("Bias");
        let params = OpQuantization::from_op(op, &filter.shape, has_bias)?;
        let scales = derive_with(&params.calib, &params.config, self.options)?;

        if self.logger.log_level_pass() == PassLogLevel::Full {
            self.logger.log_pass(&format!(
                "[convq] {} on {}: {} output scales, sum_scale={}, activation_scale={}",
                op.op_type(),
                filter.name,
                scales.output_shift_scale.len(),
                scales.sum_scale,
                scales.activation_scale,
            ));
        }

        if let Some(bias_scale) = scales.bias_scale {
            op.set_attr("Bias_scales", bias_scale);
        }
        op.set_attr("Sum_scale", scales.sum_scale);
        op.set_attr("Output_shift_scale", scales.output_shift_scale);
        op.set_attr("Activation_scale", scales.activation_scale);

        Ok(())
    }
}

impl GraphPass for ConvInt8ScalesPass {
    fn apply(&mut self, graph: &mut Graph) -> Result<usize, ConvError> {
        let (ops, vars) = graph.ops_mut();
        let mut rewritten = 0;

        for op in ops.iter_mut() {
            if !CONV_OP_TYPES.contains(&op.op_type()) || !is_int8(op)? {
                continue;
            }

            let Some(filter) = compatible_filter(op, vars) else {
                log::warn!("Pass in op compat failed.");
                continue;
            };

            self.rewrite(op, filter)?;
            rewritten += 1;
        }

        log::debug!("Attached int8 scales to {rewritten} convolutions");
        Ok(rewritten)
    }
}

fn is_int8(op: &OpDesc) -> Result<bool, ConvError> {
    Ok(op.get_attr_if_exists::<String>("mkldnn_data_type")? == "int8"
        || op.get_attr_if_exists::<bool>("use_quantizer")?)
}

/// The filter variable of a convolution wired the way the pass expects, with a known shape.
fn compatible_filter<'a>(op: &OpDesc, vars: &'a HashMap<String, VarDesc>) -> Option<&'a VarDesc> {
    let single = |names: &[String]| match names {
        [name] => Some(name.clone()),
        _ => None,
    };

    single(op.input("Input"))?;
    single(op.output("Output"))?;
    if op.input("Bias").len() > 1 {
        return None;
    }

    let filter = vars.get(&single(op.input("Filter"))?)?;
    matches!(filter.shape.len(), 4 | 5).then_some(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(op: OpDesc) -> Graph {
        let mut graph = Graph::new();
        graph.add_var(VarDesc::new("w".into(), vec![4, 2, 3, 3]));
        graph.add_op(op);
        graph
    }

    fn conv() -> OpDesc {
        OpDesc::new("conv2d")
            .with_input("Input", &["x"])
            .with_input("Filter", &["w"])
            .with_output("Output", &["y"])
            .with_attr("mkldnn_data_type", String::from("int8"))
            .with_attr("Scale_in", 2.0f32)
            .with_attr("Scale_weights", vec![0.5f32])
            .with_attr("Scale_out", 1.0f32)
    }

    fn pass() -> ConvInt8ScalesPass {
        ConvInt8ScalesPass::from_config(Arc::new(GlobalConfig::default()))
    }

    #[test]
    fn skips_float_convolutions() {
        let mut graph = graph(conv().with_attr("mkldnn_data_type", String::from("float32")));

        assert_eq!(pass().apply(&mut graph).unwrap(), 0);
        assert!(!graph.ops()[0].has_attr("Output_shift_scale"));
    }

    #[test]
    fn skips_unknown_filter() {
        let mut graph = graph(conv().with_input("Filter", &["unknown"]));

        assert_eq!(pass().apply(&mut graph).unwrap(), 0);
    }

    #[test]
    fn empty_weight_scales_abort() {
        let mut op = conv();
        op.set_attr("Scale_weights", Vec::<f32>::new());
        let mut graph = graph(op);

        assert!(matches!(pass().apply(&mut graph), Err(ConvError::Scale(_))));
    }

    #[test]
    fn attaches_scales() {
        let mut graph = graph(conv());

        assert_eq!(pass().apply(&mut graph).unwrap(), 1);

        let op = &graph.ops()[0];
        assert_eq!(op.attr::<Vec<f32>>("Output_shift_scale").unwrap(), Some(vec![1.0]));
        assert_eq!(op.attr::<f32>("Sum_scale").unwrap(), Some(1.0));
        assert_eq!(op.attr::<f32>("Activation_scale").unwrap(), Some(1.0));
        assert!(!op.has_attr("Bias_scales"));
    }
}
