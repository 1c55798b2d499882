//! Quantisation primitives: STE round/sign, 8-bit activations, ternary weights.
//!
//! This module is the mathematical foundation of the crate. Every
//! [`QuantizedLinear`](crate::linear::QuantizedLinear) delegates to these
//! functions for the forward-pass quantisation; the backward pass is routed
//! through the straight-through estimator.
//!
//! # STE construction
//!
//! Candle's autodiff treats `round` and `sign` as gradient-free. The STE
//! primitives therefore pair a detached forward value with a zero-valued
//! residual that carries the identity Jacobian:
//!
//! ```text
//! ste(x) = f(x).detach() + (x - x.detach())
//! ```
//!
//! Forward: the residual is exactly zero, so the output is `f(x)`.
//! Backward: `∂ste/∂x = 1`, so the incoming gradient passes unchanged.

use candle_core::{DType, Error, Result, Tensor, D};

/// Upper bound of the signed 8-bit activation grid.
pub const ACTIVATION_QMAX: f64 = 127.0;
/// Lower bound of the signed 8-bit activation grid.
pub const ACTIVATION_QMIN: f64 = -128.0;
/// Floor of `mean(|W|)` before it is inverted into the weight scale.
pub const WEIGHT_SCALE_MIN: f64 = 1e-5;

// ── STE primitives ──────────────────────────────────────────────────────────

/// Round to nearest integer, ties to even; gradient is the identity.
#[inline]
pub fn ste_round(x: &Tensor) -> Result<Tensor> {
    let rounded = round_half_even(&x.detach())?;
    let residual = (x - &x.detach())?;
    rounded.detach() + residual
}

/// `round` with exact `.5` ties sent to the even neighbour.
fn round_half_even(x: &Tensor) -> Result<Tensor> {
    // candle rounds ties away from zero: step those landing on odd back by one
    let rounded = x.round()?;
    let diff = (&rounded - x)?;
    let tie = diff.abs()?.eq(0.5)?;
    let half = (&rounded * 0.5)?;
    let odd = (&half - half.floor()?)?.ne(0.0)?;
    let toward_even = (&rounded - diff.sign()?)?;
    (tie * odd)?.where_cond(&toward_even, &rounded)
}

/// Elementwise sign (−1, 0, +1); gradient is the identity.
///
/// Not used by the current quantisers; available for sign-based weight
/// binarisation.
#[inline]
pub fn ste_sign(x: &Tensor) -> Result<Tensor> {
    let sign_x = x.sign()?;
    let residual = (x - &x.detach())?;
    sign_x.detach() + residual
}

// ── Quantisation functions ──────────────────────────────────────────────────

/// Machine epsilon of a floating-point dtype.
pub fn dtype_epsilon(dtype: DType) -> Result<f64> {
    match dtype {
        DType::F64 => Ok(f64::EPSILON),
        DType::F32 => Ok(f32::EPSILON as f64),
        DType::F16 => Ok(9.765_625e-4),
        DType::BF16 => Ok(7.812_5e-3),
        other => Err(Error::Msg(format!(
            "quantisation needs a floating-point tensor, got {other:?}"
        ))),
    }
}

/// Per-token 8-bit activation quantisation.
///
/// Each last-dimension row is scaled by `127 / max(|row|, ε)`, rounded with
/// [`ste_round`], clamped to `[-128, 127]` and scaled back. The result has
/// the shape of `x` and lies on a 256-level grid per row. An all-zero row
/// stays zero.
pub fn activation_quant(x: &Tensor) -> Result<Tensor> {
    let eps = dtype_epsilon(x.dtype())?;
    let max_abs = x.abs()?.max_keepdim(D::Minus1)?.maximum(eps)?;
    let scale = (max_abs.recip()? * ACTIVATION_QMAX)?;
    let scaled = x.broadcast_mul(&scale)?;
    let q = ste_round(&scaled)?.clamp(ACTIVATION_QMIN, ACTIVATION_QMAX)?;
    q.broadcast_div(&scale)
}

/// Per-tensor ternary weight quantisation (AbsMean).
///
/// `scale = 1 / max(mean(|W|), 1e-5)`; every element becomes
/// `clamp(round(w · scale), -1, 1) / scale`, i.e. one of
/// `{-mean(|W|), 0, +mean(|W|)}`.
pub fn weight_quant(w: &Tensor) -> Result<Tensor> {
    let scale = weight_scale(w)?;
    let scaled = w.broadcast_mul(&scale)?;
    let q = ste_round(&scaled)?.clamp(-1f64, 1f64)?;
    q.broadcast_div(&scale)
}

/// `1 / max(mean(|W|), 1e-5)` as a rank-0 tensor.
fn weight_scale(w: &Tensor) -> Result<Tensor> {
    w.abs()?.mean_all()?.maximum(WEIGHT_SCALE_MIN)?.recip()
}

/// Ternary code `clamp(round(w · scale), -1, 1)` (forward only, no STE).
pub fn ternary_code(w: &Tensor) -> Result<Tensor> {
    let scale = weight_scale(&w.detach())?;
    round_half_even(&w.detach().broadcast_mul(&scale)?)?.clamp(-1f64, 1f64)
}

// ── Debug helpers ───────────────────────────────────────────────────────────

/// Count {-1, 0, +1} occurrences in the ternary code of `w`.
pub fn ternary_distribution(w: &Tensor) -> Result<(u64, u64, u64)> {
    let code = ternary_code(w)?.to_dtype(DType::F32)?;
    let flat = code.flatten_all()?.to_vec1::<f32>()?;
    let (mut n_neg, mut n_zero, mut n_pos) = (0u64, 0u64, 0u64);
    for &v in &flat {
        if v < -0.5 {
            n_neg += 1;
        } else if v > 0.5 {
            n_pos += 1;
        } else {
            n_zero += 1;
        }
    }
    Ok((n_neg, n_zero, n_pos))
}

// ── Tensor helpers ──────────────────────────────────────────────────────────

/// Flatten leading dims of `x` to 2-D, multiply by `w_t`, restore them.
///
/// `x: (..., K)`, `w_t: (K, N)` → `(..., N)`.
pub fn matmul_reshape(x: &Tensor, w_t: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let Some((&k, lead)) = dims.split_last() else {
        return Err(Error::Msg("matmul_reshape: scalar input".to_string()));
    };
    let rows: usize = lead.iter().product();
    let out_dim = w_t.dim(1)?;
    let y = x.reshape((rows, k))?.matmul(w_t)?;
    let mut out_shape = lead.to_vec();
    out_shape.push(out_dim);
    y.reshape(out_shape)
}

// ── Tests ───────────────────────────────────────────────────────────────────
