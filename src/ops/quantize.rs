//! Per-axis symmetric quantization of activations and the matching
//! accumulator rescale.

use half::f16;
use ndarray::{Array, Array2, ArrayView, ArrayView2, Axis, Dimension, Zip};

/// Quantizes a float tensor to `i8` along `axis`.
///
/// Returns the quantized tensor (same shape as the input) and a per-lane
/// scale tensor whose shape equals the input shape with `axis` collapsed to
/// length 1, such that `q * scale ≈ x`.
///
/// The rule is symmetric absmax per lane: `scale = amax / 127`,
/// `q = clamp(round(x / scale), -128, 127)`. An all-zero lane keeps a zero
/// scale and all-zero codes. Only activations are quantized this way;
/// weights are quantized once at load time (see `QuantizedLinear`).
pub fn quantize<T, D>(x: ArrayView<'_, T, D>, axis: Axis) -> (Array<i8, D>, Array<f16, D>)
where
    T: Copy + Into<f32>,
    D: Dimension,
{
    assert!(
        axis.0 < x.ndim(),
        "quantize axis {} out of range for {}-d tensor",
        axis.0,
        x.ndim()
    );

    let mut q = Array::<i8, D>::zeros(x.raw_dim());
    let mut scale_dim = x.raw_dim();
    scale_dim.slice_mut()[axis.0] = 1;
    let mut scale = Array::<f16, D>::zeros(scale_dim);

    Zip::from(q.lanes_mut(axis))
        .and(x.lanes(axis))
        .and(scale.lanes_mut(axis))
        .for_each(|mut q_lane, x_lane, mut s_lane| {
            let amax = x_lane.iter().fold(0.0f32, |acc, &v| {
                let f: f32 = v.into();
                acc.max(f.abs())
            });
            if amax == 0.0 {
                return;
            }
            let d = amax / 127.0;
            let id = 1.0 / d;
            s_lane[0] = f16::from_f32(d);
            for (qv, &xv) in q_lane.iter_mut().zip(x_lane.iter()) {
                let f: f32 = xv.into();
                *qv = (f * id).round().clamp(-128.0, 127.0) as i8;
            }
        });

    (q, scale)
}

/// Rescales an `i32` matmul accumulator back to `f32`.
///
/// `weight_scale` carries one scale per output channel and `act_scale` one
/// scale per activation column; both are broadcast over the accumulator, so
/// they must be shaped with the broadcast axes already at length 1
/// (e.g. `(out, 1)` and `(1, len)` against an `(out, len)` accumulator).
pub fn rescale(
    acc: ArrayView2<'_, i32>,
    weight_scale: ArrayView2<'_, f16>,
    act_scale: ArrayView2<'_, f16>,
) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(acc.raw_dim());
    Zip::from(&mut out)
        .and(&acc)
        .and_broadcast(&weight_scale)
        .and_broadcast(&act_scale)
        .for_each(|o, &a, &w, &s| {
            *o = a as f32 * f32::from(w) * f32::from(s);
        });
    out
}
