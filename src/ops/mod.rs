//! Compute primitives underneath the attention pipeline.
//!
//! These functions are internal building blocks: shape agreement between
//! operands is checked with assertions here, while the caller-facing
//! validation lives in the `attention` and `linear` modules.

pub mod gemm;
pub mod quantize;
pub mod softmax;

pub use gemm::{igemm, sgemm_batched};
pub use quantize::{quantize, rescale};
pub use softmax::{add_position_bias, mask_scores, softmax_key_axis_inplace, MASK_VALUE};

#[cfg(test)]
mod tests;
