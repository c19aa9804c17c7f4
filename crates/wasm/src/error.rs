// SPDX-License-Identifier: Apache-2.0

//! Errors for guest resource management.

/// Errors raised while managing guest memory, stacks, or module images.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The OS refused the virtual reservation or a protection change.
    #[error("memory map of {requested} bytes failed: {source}")]
    AllocationFailed {
        /// Bytes requested from the OS.
        requested: usize,
        /// The underlying errno.
        source: nix::Error,
    },

    /// Growth past the memory's soft cap was requested.
    #[error("linear memory exhausted: size {size} + {requested} exceeds max {max}")]
    MemoryExhausted {
        /// Guest-visible size before the attempt.
        size: usize,
        /// Bytes the guest asked for.
        requested: usize,
        /// The soft cap fixed at allocation.
        max: usize,
    },

    /// A region initializer or accessor fell outside the guest-visible size.
    #[error("out of bounds access at offset {offset} len {len} (size {size})")]
    OutOfBounds {
        /// Start offset of the access.
        offset: u64,
        /// Length of the access.
        len: usize,
        /// Guest-visible size at the time of the access.
        size: usize,
    },

    /// `dlopen` could not load the module image.
    #[error("failed to load module `{path}`: {detail}")]
    ModuleLoad {
        /// Path handed to the loader.
        path: String,
        /// The `dlerror` string.
        detail: String,
    },

    /// A required ABI export is missing from the module image.
    #[error("module `{path}` is missing ABI symbol `{symbol}`")]
    MissingSymbol {
        /// Path handed to the loader.
        path: String,
        /// The unresolved symbol name.
        symbol: &'static str,
    },
}
