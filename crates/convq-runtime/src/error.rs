use alloc::string::String;
use convq_common::backtrace::BackTrace;
use thiserror::Error;

/// Errors raised by the runtime primitives and the scale cache.
#[derive(Error, Clone)]
pub enum RuntimeError {
    /// A descriptor, buffer or reorder request is inconsistent.
    #[error("Invalid memory descriptor\nCaused by:\n  {reason}\nBacktrace:\n{backtrace}")]
    InvalidDescriptor {
        /// The details of the inconsistency.
        reason: String,
        /// The captured backtrace.
        backtrace: BackTrace,
    },

    /// The cache holds an artifact of another kind under a key, or misses a companion artifact.
    #[error("The scale cache is in an inconsistent state\nCaused by:\n  {reason}")]
    CacheInconsistent {
        /// The details of the inconsistency.
        reason: String,
        /// The captured backtrace.
        backtrace: BackTrace,
    },
}

impl RuntimeError {
    pub(crate) fn invalid_descriptor(reason: String) -> Self {
        Self::InvalidDescriptor {
            reason,
            backtrace: BackTrace::capture(),
        }
    }

    pub(crate) fn cache_inconsistent(reason: String) -> Self {
        Self::CacheInconsistent {
            reason,
            backtrace: BackTrace::capture(),
        }
    }
}

impl core::fmt::Debug for RuntimeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}
