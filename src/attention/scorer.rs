//! Attention scoring and value aggregation, shared by the full-sequence and
//! incremental paths.

use half::f16;
use ndarray::{Array4, ArrayView3, ArrayView4};

use crate::error::{AttentionError, Result};
use crate::ops::gemm::sgemm_batched;
use crate::ops::softmax::{add_position_bias, mask_scores, softmax_key_axis_inplace};

/// Computes masked, optionally biased softmax attention weights.
///
/// `q` is `(batch, heads, head_dim, query_len)` and `k` is
/// `(batch, heads, head_dim, key_len)`; the result is
/// `(batch, heads, key_len, query_len)` with every `(batch, head, query)`
/// column summing to 1 over the key axis. Positions the mask marks invalid
/// receive weight 0 (exactly, as long as the column has at least one valid
/// entry). The bias, if given, is added after masking and broadcast over
/// batch when its leading axis is 1.
pub fn attention_scores(
    q: ArrayView4<'_, f32>,
    k: ArrayView4<'_, f32>,
    mask: ArrayView3<'_, bool>,
    bias: Option<ArrayView4<'_, f16>>,
) -> Result<Array4<f32>> {
    let (batch, heads, head_dim, q_len) = q.dim();
    let (kb, kh, kd, k_len) = k.dim();
    if (kb, kh, kd) != (batch, heads, head_dim) {
        return Err(AttentionError::Shape(format!(
            "query {:?} and key {:?} disagree on batch/heads/head_dim",
            q.dim(),
            k.dim()
        )));
    }
    if mask.dim() != (batch, k_len, q_len) {
        return Err(AttentionError::Shape(format!(
            "mask shape {:?} does not match (batch, key_len, query_len) = {:?}",
            mask.dim(),
            (batch, k_len, q_len)
        )));
    }
    if let Some(bias) = bias {
        let (bb, bh, bk, bq) = bias.dim();
        if (bb != 1 && bb != batch) || (bh, bk, bq) != (heads, k_len, q_len) {
            return Err(AttentionError::Shape(format!(
                "position bias shape {:?} does not broadcast over scores {:?}",
                bias.dim(),
                (batch, heads, k_len, q_len)
            )));
        }
    }

    // raw[b,h,j,i] = sum_d K[b,h,d,j] * Q[b,h,d,i]
    let k_t = k.permuted_axes([0, 1, 3, 2]);
    let mut scores = sgemm_batched(k_t, q);

    mask_scores(&mut scores, mask);
    if let Some(bias) = bias {
        add_position_bias(&mut scores, bias);
    }
    softmax_key_axis_inplace(&mut scores);
    Ok(scores)
}

/// Weighted sum of value vectors: `out[b,h,d,i] = Σ_j w[b,h,j,i] · V[b,h,d,j]`.
///
/// `weights` is `(batch, heads, key_len, query_len)` and `v` is
/// `(batch, heads, head_dim, key_len)`; the result is
/// `(batch, heads, head_dim, query_len)`.
pub fn weighted_values(
    weights: ArrayView4<'_, f32>,
    v: ArrayView4<'_, f32>,
) -> Result<Array4<f32>> {
    let (batch, heads, k_len, _q_len) = weights.dim();
    let (vb, vh, _head_dim, vk) = v.dim();
    if (vb, vh, vk) != (batch, heads, k_len) {
        return Err(AttentionError::Shape(format!(
            "value shape {:?} does not match attention weights {:?}",
            v.dim(),
            weights.dim()
        )));
    }
    Ok(sgemm_batched(v, weights))
}
