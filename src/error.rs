//! The recoverable, non-fault error channel (§2b/§7). Detected memory faults
//! and infrastructure failures are deliberately *not* represented here — they
//! terminate the process from [`crate::report`] and never produce a `Result`.

use thiserror::Error;

/// Construction-time misuse that is not itself a memory-safety violation.
#[derive(Debug, Error)]
pub enum SanitizerError {
    /// [`crate::SanitizerRuntime::init`] was called more than once.
    #[error("sanitizer runtime already initialized")]
    AlreadyInitialized,

    /// A [`crate::globals::GlobalDescriptor`] table had an entry whose
    /// `size_with_redzone` was smaller than `size`, which the compiler pass
    /// never emits and which would make [`crate::redzone::poison_redzone`]'s
    /// band computation underflow.
    #[error("global `{name}` has size {size} larger than its redzone span {size_with_redzone}")]
    MalformedGlobal {
        name: String,
        size: usize,
        size_with_redzone: usize,
    },
}
