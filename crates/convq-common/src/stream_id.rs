/// Identifies the execution stream an operator runs on.
///
/// One thread drives one stream, so the value is derived from the current thread id. Cache keys
/// carry it so two threads running the same operator never share mutable artifacts.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct StreamId {
    /// The value representing the thread id.
    pub value: u64,
}

impl StreamId {
    /// The stream shared by every thread when keys are not split per thread.
    pub const SHARED: Self = Self { value: 0 };

    /// Get the stream of the current thread.
    pub fn current() -> Self {
        Self {
            #[cfg(feature = "std")]
            value: Self::from_current_thread(),
            #[cfg(not(feature = "std"))]
            value: 0,
        }
    }

    #[cfg(feature = "std")]
    fn from_current_thread() -> u64 {
        use core::hash::Hash;

        std::thread_local! {
            static ID: std::cell::OnceCell::<u64> = const { std::cell::OnceCell::new() };
        };

        ID.with(|cell| {
            *cell.get_or_init(|| {
                let mut hasher = std::hash::DefaultHasher::default();
                std::thread::current().id().hash(&mut hasher);
                // Zero is reserved for the shared stream.
                std::hash::Hasher::finish(&hasher).max(1)
            })
        })
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("StreamId({:?})", self.value))
    }
}
