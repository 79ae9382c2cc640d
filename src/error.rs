use thiserror::Error;

/// Why a request could not be satisfied.
///
/// The pointer-returning API reports these as null; `init` and `extend`
/// return them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The memory source refused to grow.
    #[error("heap source could not grow by {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The request cannot be described by a 30-bit block size or a 32-bit
    /// heap offset.
    #[error("request for {requested} bytes exceeds the addressable heap")]
    TooLarge { requested: usize },

    /// The heap has not been set up with `init` yet.
    #[error("heap is not initialized")]
    Uninitialized,
}
