use convq_common::backtrace::BackTrace;
use convq_quant::ScaleError;
use convq_runtime::RuntimeError;
use thiserror::Error;

/// Errors raised by the convolution pass and kernels.
#[derive(Error, Clone)]
pub enum ConvError {
    /// Scales could not be derived.
    #[error(transparent)]
    Scale(#[from] ScaleError),

    /// A runtime primitive or the cache failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The operator attributes or inputs violate a precondition of the kernel.
    #[error("Invalid convolution configuration\nCaused by:\n  {reason}\nBacktrace:\n{backtrace}")]
    InvalidConfiguration {
        /// The violated precondition.
        reason: String,
        /// The captured backtrace.
        backtrace: BackTrace,
    },

    /// The requested convolution isn't supported.
    #[error("Unimplemented convolution\nCaused by:\n  {reason}")]
    Unimplemented {
        /// What is missing.
        reason: String,
        /// The captured backtrace.
        backtrace: BackTrace,
    },
}

impl ConvError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
            backtrace: BackTrace::capture(),
        }
    }

    pub(crate) fn unimplemented(reason: impl Into<String>) -> Self {
        Self::Unimplemented {
            reason: reason.into(),
            backtrace: BackTrace::capture(),
        }
    }
}

impl core::fmt::Debug for ConvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}
