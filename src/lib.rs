//! 8-bit quantized multi-head attention for transformer inference.
//!
//! This crate implements the arithmetic core of a quantized attention layer:
//! hidden states are quantized to `i8` with per-slice `f16` scales, projected
//! through pre-quantized weight matrices with an `i32` accumulator, scored
//! with a masked, numerically stable softmax in `f32`, and projected back to
//! `f16` activation precision.
//!
//! Two execution modes are provided:
//!
//! - [`SelfAttention`] runs the full pipeline over an entire sequence at once
//!   (the "prefill" pass),
//! - the [`IncrementalAttention`] implementations run one new sequence
//!   position against a persistent [`KvCache`], either writing the new
//!   key/value into the cache (self-attention) or treating the cache as
//!   read-only encoder state (cross-attention).
//!
//! All tensors use a channels-first layout: hidden states are
//! `(batch, dim_model, seq_len)`, per-head tensors are
//! `(batch, heads, head_dim, len)`. Numeric precision is carried by the
//! element type (`half::f16` activations and scales, `i8` quantized values,
//! `i32` accumulators, `f32` working precision), so passing a tensor of the
//! wrong precision is a compile error rather than a runtime check.
//!
//! The kernel is synchronous and call-scoped: every call either returns a
//! complete result or fails closed with an [`AttentionError`] before any
//! computation runs. Internally the batched matrix multiplies are
//! data-parallel over independent batch/head panels.

pub mod attention;
pub mod cache;
pub mod error;
pub mod linear;
pub mod ops;

pub use attention::incremental::{
    IncrementalAttention, IncrementalCrossAttention, IncrementalSelfAttention,
};
pub use attention::SelfAttention;
pub use cache::KvCache;
pub use error::{AttentionError, Result};
pub use linear::QuantizedLinear;
