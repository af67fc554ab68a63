use alloc::string::String;

/// Frames of the place an error was raised.
///
/// Capture follows `RUST_BACKTRACE`: when it is unset, or without the `std` feature, nothing is
/// recorded and formatting prints a hint instead.
#[derive(Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackTrace {
    frames: Option<String>,
}

impl BackTrace {
    /// Record the frames of the current thread if backtraces are enabled.
    pub fn capture() -> Self {
        #[cfg(feature = "std")]
        {
            let backtrace = std::backtrace::Backtrace::capture();
            if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
                return Self {
                    frames: Some(alloc::format!("{backtrace}")),
                };
            }
        }

        Self::default()
    }

    /// Whether frames were recorded.
    pub fn is_captured(&self) -> bool {
        self.frames.is_some()
    }
}

impl core::fmt::Display for BackTrace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.frames {
            Some(frames) => f.write_str(frames),
            None => f.write_str("<not captured, run with RUST_BACKTRACE=1>"),
        }
    }
}

impl core::fmt::Debug for BackTrace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}
