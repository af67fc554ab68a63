use thiserror::Error;

/// Errors raised while deriving quantization scales.
///
/// None of them are transient: they signal a model or configuration that cannot produce correct
/// quantized results, and the enclosing inference call must abort.
#[derive(Error, Clone, PartialEq)]
pub enum ScaleError {
    /// A calibration attribute required by the requested quantization is absent.
    #[error("Missing scale attribute `{name}`, scales must be attached during calibration")]
    MissingScaleAttribute {
        /// The attribute name.
        name: String,
    },

    /// The quantization configuration is inconsistent.
    #[error("Invalid quantization configuration\nCaused by:\n  {reason}")]
    InvalidConfiguration {
        /// Details of the violated precondition.
        reason: String,
    },
}

impl ScaleError {
    pub(crate) fn missing(name: &str) -> Self {
        Self::MissingScaleAttribute {
            name: name.to_string(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

impl core::fmt::Debug for ScaleError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}
