//! Single-step decode attention against a persistent key/value cache.

use half::f16;
use log::trace;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

use super::scorer::{attention_scores, weighted_values};
use crate::cache::KvCache;
use crate::error::{AttentionError, Result};
use crate::linear::QuantizedLinear;
use crate::ops::quantize::quantize;

/// One decode step of attention over a [`KvCache`].
///
/// The self- and cross-attention variants are separate types chosen at
/// construction rather than a runtime flag: self-attention projects query,
/// key and value from the new step and writes the key/value into the cache
/// before scoring, while cross-attention projects only the query and treats
/// the cache as read-only encoder state.
pub trait IncrementalAttention {
    /// Processes exactly one new sequence position.
    ///
    /// `hidden_state` is `(batch, dim_model)` f16. `kv_mask` has one flag
    /// per `(batch, cache position)`; positions not yet populated must be
    /// marked invalid. `position_bias`, if given, is
    /// `(1 | batch, heads, max_len)` f16. `write_index` is required for
    /// self-attention and ignored for cross-attention. Returns the new
    /// `(batch, dim_model)` hidden state.
    fn forward(
        &self,
        hidden_state: &Array2<f16>,
        cache: &mut KvCache,
        kv_mask: &Array2<bool>,
        position_bias: Option<&Array3<f16>>,
        write_index: Option<usize>,
    ) -> Result<Array2<f16>>;
}

/// Decoder self-attention: the new step is written into the cache at
/// `write_index` before scoring, so it attends to itself as well as to all
/// previously cached positions within the same call.
pub struct IncrementalSelfAttention {
    w_project_qkv: QuantizedLinear,
    w_out: QuantizedLinear,
    dim_model: usize,
    num_heads: usize,
    head_dim: usize,
}

impl IncrementalSelfAttention {
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
        check_output_projection(&w_out, dim_model, num_heads * head_dim)?;
        Ok(Self {
            w_project_qkv,
            w_out,
            dim_model,
            num_heads,
            head_dim,
        })
    }
}

impl IncrementalAttention for IncrementalSelfAttention {
    fn forward(
        &self,
        hidden_state: &Array2<f16>,
        cache: &mut KvCache,
        kv_mask: &Array2<bool>,
        position_bias: Option<&Array3<f16>>,
        write_index: Option<usize>,
    ) -> Result<Array2<f16>> {
        let write_index = write_index.ok_or_else(|| {
            AttentionError::Precondition("self-attention decode requires a write index".into())
        })?;
        validate_step(
            self.dim_model,
            self.num_heads,
            self.head_dim,
            hidden_state,
            cache,
            kv_mask,
            position_bias,
        )?;
        if write_index >= cache.max_len() {
            return Err(AttentionError::Shape(format!(
                "write index {} out of range for cache of length {}",
                write_index,
                cache.max_len()
            )));
        }
        let batch = hidden_state.nrows();
        trace!("incremental self-attention: batch={batch} write_index={write_index}");

        let (q_act, act_scale) = quantize(hidden_state.view(), Axis(1));
        let qkv = self.w_project_qkv.forward_2d(q_act.view(), act_scale.view())?;

        // (batch, 3*heads*head_dim) -> (batch, 3, heads, head_dim); owned
        // standard-layout buffer, so the reshape does not copy.
        let qkv = qkv
            .into_shape_with_order((batch, 3, self.num_heads, self.head_dim))
            .map_err(|e| AttentionError::Shape(e.to_string()))?;
        let query = qkv.index_axis(Axis(1), 0);
        let new_k = qkv.index_axis(Axis(1), 1);
        let new_v = qkv.index_axis(Axis(1), 2);

        // The new position must be visible to its own query, so the cache
        // write happens before scoring.
        cache.write(write_index, new_k, new_v)?;

        let context = attend_cache(
            query,
            cache,
            kv_mask.view(),
            position_bias.map(|b| b.view()),
        )?;
        project_out(&self.w_out, context)
    }
}

/// Decoder cross-attention: the cache holds projected encoder keys/values
/// and is never mutated here; only the query is computed from the step.
pub struct IncrementalCrossAttention {
    w_project_q: QuantizedLinear,
    w_out: QuantizedLinear,
    dim_model: usize,
    num_heads: usize,
    head_dim: usize,
}

impl IncrementalCrossAttention {
    pub fn new(
        dim_model: usize,
        num_heads: usize,
        head_dim: usize,
        w_project_q: QuantizedLinear,
        w_out: QuantizedLinear,
    ) -> Result<Self> {
        let q_dim = num_heads * head_dim;
        if w_project_q.out_features() != q_dim || w_project_q.in_features() != dim_model {
            return Err(AttentionError::Shape(format!(
                "query projection is {}x{} but the configuration requires {}x{}",
                w_project_q.out_features(),
                w_project_q.in_features(),
                q_dim,
                dim_model
            )));
        }
        check_output_projection(&w_out, dim_model, q_dim)?;
        Ok(Self {
            w_project_q,
            w_out,
            dim_model,
            num_heads,
            head_dim,
        })
    }
}

impl IncrementalAttention for IncrementalCrossAttention {
    fn forward(
        &self,
        hidden_state: &Array2<f16>,
        cache: &mut KvCache,
        kv_mask: &Array2<bool>,
        position_bias: Option<&Array3<f16>>,
        _write_index: Option<usize>,
    ) -> Result<Array2<f16>> {
        validate_step(
            self.dim_model,
            self.num_heads,
            self.head_dim,
            hidden_state,
            cache,
            kv_mask,
            position_bias,
        )?;
        let batch = hidden_state.nrows();
        trace!("incremental cross-attention: batch={batch}");

        let (q_act, act_scale) = quantize(hidden_state.view(), Axis(1));
        let q = self.w_project_q.forward_2d(q_act.view(), act_scale.view())?;
        let query = q
            .into_shape_with_order((batch, self.num_heads, self.head_dim))
            .map_err(|e| AttentionError::Shape(e.to_string()))?;

        let context = attend_cache(
            query.view(),
            cache,
            kv_mask.view(),
            position_bias.map(|b| b.view()),
        )?;
        project_out(&self.w_out, context)
    }
}

fn check_output_projection(
    w_out: &QuantizedLinear,
    dim_model: usize,
    inner_dim: usize,
) -> Result<()> {
    if w_out.out_features() != dim_model || w_out.in_features() != inner_dim {
        return Err(AttentionError::Shape(format!(
            "output projection is {}x{} but the configuration requires {}x{}",
            w_out.out_features(),
            w_out.in_features(),
            dim_model,
            inner_dim
        )));
    }
    Ok(())
}

fn validate_step(
    dim_model: usize,
    num_heads: usize,
    head_dim: usize,
    hidden_state: &Array2<f16>,
    cache: &KvCache,
    kv_mask: &Array2<bool>,
    position_bias: Option<&Array3<f16>>,
) -> Result<()> {
    let (batch, dim_in) = hidden_state.dim();
    if dim_in != dim_model {
        return Err(AttentionError::Shape(format!(
            "hidden state model dimension {} does not match configured {}",
            dim_in, dim_model
        )));
    }
    if cache.batch() != batch || cache.heads() != num_heads || cache.head_dim() != head_dim {
        return Err(AttentionError::Shape(format!(
            "cache layout (batch={}, heads={}, head_dim={}) does not match \
             (batch={}, heads={}, head_dim={})",
            cache.batch(),
            cache.heads(),
            cache.head_dim(),
            batch,
            num_heads,
            head_dim
        )));
    }
    if kv_mask.dim() != (batch, cache.max_len()) {
        return Err(AttentionError::Shape(format!(
            "cache validity mask shape {:?} does not match (batch, max_len) = {:?}",
            kv_mask.dim(),
            (batch, cache.max_len())
        )));
    }
    if let Some(bias) = position_bias {
        let (bb, bh, bk) = bias.dim();
        if (bb != 1 && bb != batch) || (bh, bk) != (num_heads, cache.max_len()) {
            return Err(AttentionError::Shape(format!(
                "position bias shape {:?} does not match (1|batch, heads, max_len)",
                bias.dim()
            )));
        }
    }
    Ok(())
}

/// Scores a single-step query against the whole cache buffer and aggregates
/// the cached values, reusing the full-sequence scorer with `query_len = 1`.
fn attend_cache(
    query: ArrayView3<'_, f32>,
    cache: &KvCache,
    kv_mask: ArrayView2<'_, bool>,
    position_bias: Option<ArrayView3<'_, f16>>,
) -> Result<Array2<f32>> {
    let (batch, heads, head_dim) = query.dim();
    let q4 = query.insert_axis(Axis(3));
    let mask3 = kv_mask.insert_axis(Axis(2));
    let bias4 = position_bias.map(|b| b.insert_axis(Axis(3)));

    let weights = attention_scores(q4, cache.keys(), mask3, bias4)?;
    let context = weighted_values(weights.view(), cache.values())?;
    context
        .into_shape_with_order((batch, heads * head_dim))
        .map_err(|e| AttentionError::Shape(e.to_string()))
}

/// Concatenated heads back through the quantized output projection.
fn project_out(w_out: &QuantizedLinear, context: Array2<f32>) -> Result<Array2<f16>> {
    let (q_ctx, ctx_scale) = quantize(context.view(), Axis(1));
    let out = w_out.forward_2d(q_ctx.view(), ctx_scale.view())?;
    Ok(out.mapv(f16::from_f32))
}
