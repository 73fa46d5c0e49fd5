//! Quantized linear projections.
//!
//! Weight matrices are stored in `[out_features, in_features]` layout with
//! one `f16` scale per output channel, and stay quantized for their whole
//! lifetime; activations are quantized per call by the attention pipeline.

use half::f16;
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

use crate::error::{AttentionError, Result};
use crate::ops::gemm::igemm;
use crate::ops::quantize::{quantize, rescale};

/// An 8-bit weight matrix plus per-output-channel scales.
///
/// Projection computes `Y = (Q @ W') * (w_scale ⊗ a_scale)`: an integer
/// matmul into an `i32` accumulator followed by a broadcast rescale to
/// `f32`. The accumulator is rescaled into a fresh output buffer rather
/// than reinterpreted in place.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    weight: Array2<i8>,
    scale: Array1<f16>,
}

impl QuantizedLinear {
    /// Wraps an already-quantized weight matrix and its channel scales.
    pub fn new(weight: Array2<i8>, scale: Array1<f16>) -> Result<Self> {
        if weight.nrows() != scale.len() {
            return Err(AttentionError::Shape(format!(
                "weight has {} output channels but scale has {}",
                weight.nrows(),
                scale.len()
            )));
        }
        Ok(Self { weight, scale })
    }

    /// Quantizes a full-precision `[out, in]` matrix with one symmetric
    /// absmax scale per output channel.
    pub fn from_f32(weight: ArrayView2<'_, f32>) -> Self {
        let (qs, scale) = quantize(weight, Axis(1));
        Self {
            weight: qs,
            scale: scale.remove_axis(Axis(1)),
        }
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Projects a quantized full-sequence activation.
    ///
    /// `q` is `(batch, in_features, len)` with column scales
    /// `(batch, 1, len)`; the result is `(batch, out_features, len)` in f32.
    pub fn forward_3d(
        &self,
        q: ArrayView3<'_, i8>,
        act_scale: ArrayView3<'_, f16>,
    ) -> Result<Array3<f32>> {
        let (batch, dim_in, len) = q.dim();
        if dim_in != self.in_features() {
            return Err(AttentionError::Shape(format!(
                "activation inner dimension {} does not match weight in_features {}",
                dim_in,
                self.in_features()
            )));
        }
        if act_scale.dim() != (batch, 1, len) {
            return Err(AttentionError::Shape(format!(
                "activation scale shape {:?} does not match (batch, 1, len) = {:?}",
                act_scale.dim(),
                (batch, 1, len)
            )));
        }

        let mut out = Array3::<f32>::zeros((batch, self.out_features(), len));
        let w_scale = self.scale.view().insert_axis(Axis(1));
        Zip::from(out.outer_iter_mut())
            .and(q.outer_iter())
            .and(act_scale.outer_iter())
            .for_each(|mut out_b, q_b, s_b| {
                let acc = igemm(self.weight.view(), q_b);
                out_b.assign(&rescale(acc.view(), w_scale, s_b));
            });
        Ok(out)
    }

    /// Projects a quantized single-step activation.
    ///
    /// `q` is `(batch, in_features)` with per-row scales `(batch, 1)`; the
    /// result is `(batch, out_features)` in f32.
    pub fn forward_2d(
        &self,
        q: ArrayView2<'_, i8>,
        act_scale: ArrayView2<'_, f16>,
    ) -> Result<Array2<f32>> {
        let (batch, dim_in) = q.dim();
        if dim_in != self.in_features() {
            return Err(AttentionError::Shape(format!(
                "activation inner dimension {} does not match weight in_features {}",
                dim_in,
                self.in_features()
            )));
        }
        if act_scale.dim() != (batch, 1) {
            return Err(AttentionError::Shape(format!(
                "activation scale shape {:?} does not match (batch, 1) = {:?}",
                act_scale.dim(),
                (batch, 1)
            )));
        }

        let acc = igemm(q, self.weight.t());
        let w_scale = self.scale.view().insert_axis(Axis(0));
        Ok(rescale(acc.view(), w_scale, act_scale))
    }
}
