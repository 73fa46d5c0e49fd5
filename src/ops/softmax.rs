//! Score masking, position-bias addition and key-axis softmax.

use half::f16;
use libm::expf;
use ndarray::{Array4, ArrayView3, ArrayView4, Axis, Zip};

/// Score assigned to masked positions.
///
/// A large negative finite value rather than `-inf`: when an entire key
/// column is masked the softmax still produces finite weights instead of
/// NaN from `exp(-inf) / 0`.
pub const MASK_VALUE: f32 = -1e10;

/// Overwrites masked score entries with [`MASK_VALUE`].
///
/// `scores` is `(batch, heads, key_len, query_len)`; `mask` is
/// `(batch, key_len, query_len)` with `false` marking invalid positions and
/// is broadcast over the head axis.
pub fn mask_scores(scores: &mut Array4<f32>, mask: ArrayView3<'_, bool>) {
    let dim = scores.dim();
    let (batch, _, k_len, q_len) = dim;
    assert_eq!(
        mask.dim(),
        (batch, k_len, q_len),
        "mask shape {:?} does not match scores {:?}",
        mask.dim(),
        dim
    );

    let mask_h = mask.insert_axis(Axis(1));
    let mask_b = mask_h
        .broadcast(dim)
        .expect("mask must broadcast over the head axis");
    Zip::from(&mut *scores).and(&mask_b).for_each(|s, &valid| {
        if !valid {
            *s = MASK_VALUE;
        }
    });
}

/// Adds a position bias to the scores, broadcasting over batch.
///
/// `bias` is `(1 | batch, heads, key_len, query_len)` in f16 and is widened
/// to f32 on the fly. Applied after masking, so a bias never revives a
/// masked position.
pub fn add_position_bias(scores: &mut Array4<f32>, bias: ArrayView4<'_, f16>) {
    let dim = scores.dim();
    let bias_b = bias
        .broadcast(dim)
        .unwrap_or_else(|| panic!("bias shape {:?} does not broadcast over scores {:?}", bias.dim(), dim));
    Zip::from(&mut *scores).and(&bias_b).for_each(|s, &b| {
        *s += f32::from(b);
    });
}

/// Numerically stable softmax over the key axis (axis 2) of a
/// `(batch, heads, key_len, query_len)` score tensor, in place.
///
/// Each `(batch, head, query)` lane has its maximum subtracted before
/// exponentiation; masked entries underflow to exactly zero whenever the
/// lane contains at least one unmasked score.
pub fn softmax_key_axis_inplace(scores: &mut Array4<f32>) {
    Zip::from(scores.lanes_mut(Axis(2))).par_for_each(|mut lane| {
        let max = lane.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut sum = 0.0f32;
        for v in lane.iter_mut() {
            *v = expf(*v - max);
            sum += *v;
        }
        if sum > 0.0 {
            let inv = 1.0 / sum;
            for v in lane.iter_mut() {
                *v *= inv;
            }
        }
    });
}
