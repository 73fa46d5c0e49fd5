//! Integer and batched floating-point matrix multiplication.

use faer::Parallelism;
use ndarray::{Array2, Array4, ArrayView2, ArrayView4, Zip};
use rayon::prelude::*;

/// Computes `C = A @ B` over `i8` operands with an `i32` accumulator.
///
/// `A` is `(m, k)` and `B` is `(k, n)`. Transposed operands are passed as
/// `.t()` views; the kernel handles non-contiguous inputs. Rows of the
/// output are independent and computed in parallel.
pub fn igemm(a: ArrayView2<'_, i8>, b: ArrayView2<'_, i8>) -> Array2<i32> {
    let (m, k) = a.dim();
    let (k2, n) = b.dim();
    assert_eq!(k, k2, "igemm inner dimensions do not match: {} vs {}", k, k2);

    let mut c = Array2::<i32>::zeros((m, n));
    c.outer_iter_mut()
        .into_par_iter()
        .zip(a.outer_iter())
        .for_each(|(mut c_row, a_row)| {
            // Walk B row-wise so the inner loop streams contiguous memory.
            for (&a_val, b_row) in a_row.iter().zip(b.outer_iter()) {
                let a_val = a_val as i32;
                for (c_val, &b_val) in c_row.iter_mut().zip(b_row.iter()) {
                    *c_val += a_val * b_val as i32;
                }
            }
        });
    c
}

/// Batched `C[b,h] = A[b,h] @ B[b,h]` over the two leading axes.
///
/// `A` is `(batch, heads, m, k)` and `B` is `(batch, heads, k, n)`. The
/// panels are independent, so the batch axis is data-parallel while faer
/// runs single-threaded inside each panel.
pub fn sgemm_batched(a: ArrayView4<'_, f32>, b: ArrayView4<'_, f32>) -> Array4<f32> {
    let (batch, heads, m, k) = a.dim();
    let (b2, h2, k2, n) = b.dim();
    assert_eq!(
        (batch, heads, k),
        (b2, h2, k2),
        "sgemm_batched operand shapes do not match: {:?} vs {:?}",
        a.dim(),
        b.dim()
    );

    let mut out = Array4::<f32>::zeros((batch, heads, m, n));
    Zip::from(out.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    let a_s = a_h.as_standard_layout();
                    let b_s = b_h.as_standard_layout();
                    let o_s = out_h.as_slice_mut().expect("output panel must be contiguous");

                    faer::linalg::matmul::matmul(
                        faer::mat::from_row_major_slice_mut(o_s, m, n),
                        faer::mat::from_row_major_slice(a_s.as_slice().unwrap(), m, k),
                        faer::mat::from_row_major_slice(b_s.as_slice().unwrap(), k, n),
                        None,
                        1.0,
                        Parallelism::None, // no internal threads; the batch loop is already parallel
                    );
                });
        });
    out
}
