//! Key/value cache for incremental decoding.

use ndarray::{s, Array4, ArrayView3, ArrayView4};

use crate::error::{AttentionError, Result};

/// Persistent key/value store for single-step decoding.
///
/// Keys and values are each `(batch, heads, head_dim, max_len)` in f32. The
/// cache is owned by the decode loop and outlives individual attention
/// calls: the incremental self-attention path writes the newest position
/// before scoring, while cross-attention reads a cache filled by an encoder
/// pass and never mutates it. Positions that have not been written yet must
/// be marked invalid by the caller's validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct KvCache {
    keys: Array4<f32>,
    values: Array4<f32>,
}

impl KvCache {
    /// Allocates a zeroed cache with room for `max_len` positions.
    pub fn new(batch: usize, heads: usize, head_dim: usize, max_len: usize) -> Self {
        Self {
            keys: Array4::zeros((batch, heads, head_dim, max_len)),
            values: Array4::zeros((batch, heads, head_dim, max_len)),
        }
    }

    pub fn batch(&self) -> usize {
        self.keys.shape()[0]
    }

    pub fn heads(&self) -> usize {
        self.keys.shape()[1]
    }

    pub fn head_dim(&self) -> usize {
        self.keys.shape()[2]
    }

    pub fn max_len(&self) -> usize {
        self.keys.shape()[3]
    }

    pub fn keys(&self) -> ArrayView4<'_, f32> {
        self.keys.view()
    }

    pub fn values(&self) -> ArrayView4<'_, f32> {
        self.values.view()
    }

    /// Stores one key/value step `(batch, heads, head_dim)` at `index`.
    pub fn write(
        &mut self,
        index: usize,
        key: ArrayView3<'_, f32>,
        value: ArrayView3<'_, f32>,
    ) -> Result<()> {
        if index >= self.max_len() {
            return Err(AttentionError::Shape(format!(
                "write index {} out of range for cache of length {}",
                index,
                self.max_len()
            )));
        }
        let expected = (self.batch(), self.heads(), self.head_dim());
        if key.dim() != expected || value.dim() != expected {
            return Err(AttentionError::Shape(format!(
                "key/value step shapes {:?}/{:?} do not match cache layout {:?}",
                key.dim(),
                value.dim(),
                expected
            )));
        }

        self.keys.slice_mut(s![.., .., .., index]).assign(&key);
        self.values.slice_mut(s![.., .., .., index]).assign(&value);
        Ok(())
    }
}
