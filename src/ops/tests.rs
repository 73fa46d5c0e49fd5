use approx::assert_abs_diff_eq;
use half::f16;
use ndarray::{Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ops::gemm::{igemm, sgemm_batched};
use crate::ops::quantize::{quantize, rescale};
use crate::ops::softmax::{add_position_bias, mask_scores, softmax_key_axis_inplace, MASK_VALUE};

fn random_matrix_f32(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
}

fn random_matrix_i8(rows: usize, cols: usize, seed: u64) -> Array2<i8> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-128i16..=127) as i8)
}

#[test]
fn quantize_roundtrip_3d() {
    let mut rng = StdRng::seed_from_u64(7);
    let x = Array3::from_shape_fn((2, 64, 5), |_| rng.gen_range(-1.0f32..1.0));

    let (q, scale) = quantize(x.view(), Axis(1));
    assert_eq!(q.dim(), (2, 64, 5));
    assert_eq!(scale.dim(), (2, 1, 5));

    // Worst case per element is half a quantization step plus f16 scale
    // rounding; with values in [-1, 1] the step is at most 1/127.
    for ((b, c, t), &orig) in x.indexed_iter() {
        let deq = q[[b, c, t]] as f32 * f32::from(scale[[b, 0, t]]);
        assert!(
            (deq - orig).abs() < 0.01,
            "dequantized {} too far from {} at ({}, {}, {})",
            deq,
            orig,
            b,
            c,
            t
        );
    }
}

#[test]
fn quantize_zero_lane_yields_zero_scale() {
    let x = Array2::<f32>::zeros((3, 4));
    let (q, scale) = quantize(x.view(), Axis(1));
    assert!(q.iter().all(|&v| v == 0));
    assert!(scale.iter().all(|&s| s == f16::from_f32(0.0)));
}

#[test]
fn quantize_collapses_requested_axis_only() {
    let x = random_matrix_f32(6, 9, 11);
    let (_, scale0) = quantize(x.view(), Axis(0));
    let (_, scale1) = quantize(x.view(), Axis(1));
    assert_eq!(scale0.dim(), (1, 9));
    assert_eq!(scale1.dim(), (6, 1));
}

#[test]
fn igemm_matches_i64_ground_truth() {
    let a = random_matrix_i8(5, 16, 3);
    let b = random_matrix_i8(16, 7, 4);

    let c = igemm(a.view(), b.view());
    assert_eq!(c.dim(), (5, 7));

    for i in 0..5 {
        for j in 0..7 {
            let mut sum = 0i64;
            for x in 0..16 {
                sum += a[[i, x]] as i64 * b[[x, j]] as i64;
            }
            assert_eq!(c[[i, j]] as i64, sum, "mismatch at ({}, {})", i, j);
        }
    }
}

#[test]
fn igemm_accepts_transposed_views() {
    let a = random_matrix_i8(4, 8, 21);
    let b = random_matrix_i8(6, 8, 22);

    // a (4, 8) @ b.t() (8, 6)
    let c = igemm(a.view(), b.t());
    for i in 0..4 {
        for j in 0..6 {
            let mut sum = 0i32;
            for x in 0..8 {
                sum += a[[i, x]] as i32 * b[[j, x]] as i32;
            }
            assert_eq!(c[[i, j]], sum);
        }
    }
}

#[test]
fn sgemm_batched_matches_naive() {
    let mut rng = StdRng::seed_from_u64(9);
    let a = Array4::from_shape_fn((2, 3, 4, 5), |_| rng.gen_range(-1.0f32..1.0));
    let b = Array4::from_shape_fn((2, 3, 5, 6), |_| rng.gen_range(-1.0f32..1.0));

    let c = sgemm_batched(a.view(), b.view());
    assert_eq!(c.dim(), (2, 3, 4, 6));

    for bi in 0..2 {
        for h in 0..3 {
            for i in 0..4 {
                for j in 0..6 {
                    let mut sum = 0.0f32;
                    for x in 0..5 {
                        sum += a[[bi, h, i, x]] * b[[bi, h, x, j]];
                    }
                    assert_abs_diff_eq!(c[[bi, h, i, j]], sum, epsilon = 1e-5);
                }
            }
        }
    }
}

#[test]
fn sgemm_batched_handles_permuted_operands() {
    let mut rng = StdRng::seed_from_u64(13);
    let a = Array4::from_shape_fn((1, 2, 5, 4), |_| rng.gen_range(-1.0f32..1.0));
    let b = Array4::from_shape_fn((1, 2, 5, 3), |_| rng.gen_range(-1.0f32..1.0));

    // a^T along the panel axes: (1, 2, 4, 5) @ (1, 2, 5, 3)
    let a_t = a.view().permuted_axes([0, 1, 3, 2]);
    let c = sgemm_batched(a_t, b.view());

    for h in 0..2 {
        for i in 0..4 {
            for j in 0..3 {
                let mut sum = 0.0f32;
                for x in 0..5 {
                    sum += a[[0, h, x, i]] * b[[0, h, x, j]];
                }
                assert_abs_diff_eq!(c[[0, h, i, j]], sum, epsilon = 1e-5);
            }
        }
    }
}

#[test]
fn rescale_broadcasts_both_scales() {
    let acc = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as i32);
    let w_scale = Array2::from_shape_fn((3, 1), |(i, _)| f16::from_f32(0.5 * (i + 1) as f32));
    let a_scale = Array2::from_shape_fn((1, 4), |(_, j)| f16::from_f32(0.25 * (j + 1) as f32));

    let out = rescale(acc.view(), w_scale.view(), a_scale.view());
    for i in 0..3 {
        for j in 0..4 {
            let expected = acc[[i, j]] as f32
                * f32::from(w_scale[[i, 0]])
                * f32::from(a_scale[[0, j]]);
            assert_abs_diff_eq!(out[[i, j]], expected, epsilon = 1e-6);
        }
    }
}

#[test]
fn mask_scores_overwrites_invalid_positions() {
    let mut scores = Array4::from_elem((1, 2, 3, 3), 1.0f32);
    let mut mask = Array3::from_elem((1, 3, 3), true);
    mask[[0, 1, 0]] = false;

    mask_scores(&mut scores, mask.view());
    for h in 0..2 {
        assert_eq!(scores[[0, h, 1, 0]], MASK_VALUE);
        assert_eq!(scores[[0, h, 1, 1]], 1.0);
        assert_eq!(scores[[0, h, 0, 0]], 1.0);
    }
}

#[test]
fn position_bias_broadcasts_over_batch() {
    let mut scores = Array4::<f32>::zeros((2, 2, 3, 1));
    let bias = Array4::from_shape_fn((1, 2, 3, 1), |(_, h, k, _)| {
        f16::from_f32((h * 3 + k) as f32)
    });

    add_position_bias(&mut scores, bias.view());
    for b in 0..2 {
        for h in 0..2 {
            for k in 0..3 {
                assert_abs_diff_eq!(scores[[b, h, k, 0]], (h * 3 + k) as f32, epsilon = 1e-3);
            }
        }
    }
}

#[test]
fn softmax_normalizes_over_key_axis() {
    let mut rng = StdRng::seed_from_u64(17);
    let mut scores = Array4::from_shape_fn((2, 2, 5, 3), |_| rng.gen_range(-4.0f32..4.0));

    softmax_key_axis_inplace(&mut scores);
    for b in 0..2 {
        for h in 0..2 {
            for q in 0..3 {
                let sum: f32 = (0..5).map(|k| scores[[b, h, k, q]]).sum();
                assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-3);
            }
        }
    }
}

#[test]
fn masked_entries_underflow_to_exact_zero() {
    let mut scores = Array4::from_elem((1, 1, 4, 1), 0.5f32);
    scores[[0, 0, 2, 0]] = MASK_VALUE;

    softmax_key_axis_inplace(&mut scores);
    assert_eq!(scores[[0, 0, 2, 0]], 0.0);
    let sum: f32 = (0..4).map(|k| scores[[0, 0, k, 0]]).sum();
    assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);
}

#[test]
fn fully_masked_column_stays_finite() {
    // Every key masked: the stable softmax degrades to a uniform
    // distribution instead of NaN, which is the intended behavior of
    // clamping to MASK_VALUE rather than -inf.
    let mut scores = Array4::from_elem((1, 1, 4, 1), MASK_VALUE);
    softmax_key_axis_inplace(&mut scores);
    for k in 0..4 {
        assert!(scores[[0, 0, k, 0]].is_finite());
        assert_abs_diff_eq!(scores[[0, 0, k, 0]], 0.25, epsilon = 1e-6);
    }
}
