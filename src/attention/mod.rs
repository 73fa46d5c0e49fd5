//! Quantized multi-head attention layers.

pub mod incremental;
pub mod scorer;

use half::f16;
use log::debug;
use ndarray::{Array3, Array4, Axis};

use crate::error::{AttentionError, Result};
use crate::linear::QuantizedLinear;
use crate::ops::quantize::quantize;
use self::scorer::{attention_scores, weighted_values};

/// Full-sequence ("prefill") self-attention over quantized weights.
///
/// The QKV projection produces query, key and value in a single matmul; its
/// output channels must be ordered `[all Q heads][all K heads][all V heads]`
/// so the projected buffer reshapes into the three per-type tensors without
/// a copy.
pub struct SelfAttention {
    w_project_qkv: QuantizedLinear,
    w_out: QuantizedLinear,
    dim_model: usize,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    pub fn new(
        dim_model: usize,
        num_heads: usize,
        head_dim: usize,
        w_project_qkv: QuantizedLinear,
        w_out: QuantizedLinear,
    ) -> Result<Self> {
        let qkv_dim = 3 * num_heads * head_dim;
        if w_project_qkv.out_features() != qkv_dim || w_project_qkv.in_features() != dim_model {
            return Err(AttentionError::Shape(format!(
                "QKV projection is {}x{} but the configuration requires {}x{}",
                w_project_qkv.out_features(),
                w_project_qkv.in_features(),
                qkv_dim,
                dim_model
            )));
        }
        if w_out.out_features() != dim_model || w_out.in_features() != num_heads * head_dim {
            return Err(AttentionError::Shape(format!(
                "output projection is {}x{} but the configuration requires {}x{}",
                w_out.out_features(),
                w_out.in_features(),
                dim_model,
                num_heads * head_dim
            )));
        }
        Ok(Self {
            w_project_qkv,
            w_out,
            dim_model,
            num_heads,
            head_dim,
        })
    }

    /// Runs attention over a whole sequence.
    ///
    /// `hidden_state` is `(batch, dim_model, seq_len)` f16;
    /// `attention_mask` is `(batch, key_len, query_len)` with both lengths
    /// equal to `seq_len`; `position_bias`, if given, is
    /// `(1 | batch, heads, key_len, query_len)` f16. Returns a tensor of the
    /// same shape and precision as the input.
    pub fn forward(
        &self,
        hidden_state: &Array3<f16>,
        attention_mask: &Array3<bool>,
        position_bias: Option<&Array4<f16>>,
    ) -> Result<Array3<f16>> {
        let (batch, dim_model, seq_len) = hidden_state.dim();
        if dim_model != self.dim_model {
            return Err(AttentionError::Shape(format!(
                "hidden state model dimension {} does not match configured {}",
                dim_model, self.dim_model
            )));
        }
        if attention_mask.dim() != (batch, seq_len, seq_len) {
            return Err(AttentionError::Shape(format!(
                "attention mask shape {:?} does not match (batch, seq_len, seq_len) = {:?}",
                attention_mask.dim(),
                (batch, seq_len, seq_len)
            )));
        }
        if let Some(bias) = position_bias {
            let (bb, bh, bk, bq) = bias.dim();
            if (bb != 1 && bb != batch) || (bh, bk, bq) != (self.num_heads, seq_len, seq_len) {
                return Err(AttentionError::Shape(format!(
                    "position bias shape {:?} does not match (1|batch, heads, seq_len, seq_len)",
                    bias.dim()
                )));
            }
        }
        debug!("self-attention prefill: batch={batch} seq_len={seq_len}");

        // Quantize along the model dimension, one scale per (batch, position).
        let (q_act, act_scale) = quantize(hidden_state.view(), Axis(1));
        let qkv = self
            .w_project_qkv
            .forward_3d(q_act.view(), act_scale.view())?;

        // (batch, 3*heads*head_dim, L) -> (batch, 3, heads, head_dim, L).
        // The buffer is owned and in standard layout, so this reshape is a
        // reinterpretation, not a copy.
        let qkv = qkv
            .into_shape_with_order((batch, 3, self.num_heads, self.head_dim, seq_len))
            .map_err(|e| AttentionError::Shape(e.to_string()))?;
        let query = qkv.index_axis(Axis(1), 0);
        let key = qkv.index_axis(Axis(1), 1);
        let value = qkv.index_axis(Axis(1), 2);

        let weights = attention_scores(
            query,
            key,
            attention_mask.view(),
            position_bias.map(|b| b.view()),
        )?;
        let context = weighted_values(weights.view(), value)?;

        // (batch, heads, head_dim, L) -> (batch, heads*head_dim, L), heads
        // concatenated back along the channel axis.
        let context = context
            .into_shape_with_order((batch, self.num_heads * self.head_dim, seq_len))
            .map_err(|e| AttentionError::Shape(e.to_string()))?;

        let (q_ctx, ctx_scale) = quantize(context.view(), Axis(1));
        let out = self.w_out.forward_3d(q_ctx.view(), ctx_scale.view())?;
        Ok(out.mapv(f16::from_f32))
    }
}
