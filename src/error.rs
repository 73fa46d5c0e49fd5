//! Error types for the attention kernel.

use thiserror::Error;

/// Errors raised by the attention kernel.
///
/// All checks run eagerly before any computation; a returned error means no
/// partial results were produced and the cache was not touched. Precision
/// mismatches are not represented here because tensor dtypes are part of the
/// type signatures and cannot be wrong at runtime.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Dimension or axis mismatch between two tensors, or between a tensor
    /// and the layer configuration.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A call-level precondition was violated.
    #[error("precondition violated: {0}")]
    Precondition(String),
}

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, AttentionError>;
