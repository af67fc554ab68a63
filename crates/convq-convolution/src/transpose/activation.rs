use crate::ConvError;

/// Activation fused into a convolution as an eltwise post-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    LeakyRelu,
    Relu6,
    Swish,
    HardSwish,
    Sigmoid,
    Tanh,
    Abs,
    Sqrt,
}

impl Activation {
    /// Parse the `fuse_activation` attribute, an empty name meaning no activation.
    pub fn parse(name: &str) -> Result<Option<Self>, ConvError> {
        let activation = match name {
            "" => return Ok(None),
            "relu" => Self::Relu,
            "leaky_relu" => Self::LeakyRelu,
            "relu6" => Self::Relu6,
            "swish" => Self::Swish,
            "hard_swish" => Self::HardSwish,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "abs" => Self::Abs,
            "sqrt" => Self::Sqrt,
            other => {
                return Err(ConvError::invalid(format!(
                    "activation `{other}` can't be fused"
                )))
            }
        };

        Ok(Some(activation))
    }

    /// Whether the activation never produces negative values, so int8 outputs can be unsigned.
    pub fn is_unsigned(&self) -> bool {
        matches!(self, Self::Relu | Self::Relu6)
    }

    /// Apply the activation, `alpha` and `beta` being the `fuse_alpha` and `fuse_beta`
    /// attributes. Zero parameters select the usual defaults.
    pub fn apply(&self, x: f32, alpha: f32, beta: f32) -> f32 {
        match self {
            Self::Relu | Self::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Self::Relu6 => {
                let bound = if alpha > 0.0 { alpha } else { 6.0 };
                x.clamp(0.0, bound)
            }
            Self::Swish => {
                let alpha = if alpha == 0.0 { 1.0 } else { alpha };
                x * sigmoid(alpha * x)
            }
            Self::HardSwish => {
                let alpha = if alpha == 0.0 { 1.0 / 6.0 } else { alpha };
                let beta = if beta == 0.0 { 0.5 } else { beta };
                x * (alpha * x + beta).clamp(0.0, 1.0)
            }
            Self::Sigmoid => sigmoid(x),
            Self::Tanh => x.tanh(),
            Self::Abs => x.abs(),
            Self::Sqrt => x.sqrt(),
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu6_is_bounded() {
        let relu6 = Activation::parse("relu6").unwrap().unwrap();

        assert_eq!(relu6.apply(-1.0, 0.0, 0.0), 0.0);
        assert_eq!(relu6.apply(9.0, 0.0, 0.0), 6.0);
        assert!(relu6.is_unsigned());
    }

    #[test]
    fn leaky_relu_uses_alpha() {
        let leaky = Activation::parse("leaky_relu").unwrap().unwrap();

        assert_eq!(leaky.apply(-2.0, 0.5, 0.0), -1.0);
        assert!(!leaky.is_unsigned());
    }

    #[test]
    fn hard_swish_defaults() {
        let hard_swish = Activation::HardSwish;

        assert_eq!(hard_swish.apply(3.0, 0.0, 0.0), 3.0);
        assert_eq!(hard_swish.apply(-3.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn empty_and_unknown_names() {
        assert_eq!(Activation::parse("").unwrap(), None);
        assert!(Activation::parse("gelu_tanh").is_err());
    }
}
