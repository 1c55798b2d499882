//! Quantization-aware linear layer (BitLinear).
//!
//! The layer stores full-precision (f32) latent weights and bias. Each forward
//! pass normalises the input, quantises activations to 8 bits per token and
//! weights to ternary per tensor, then multiplies in quantised space. Nothing
//! quantised is cached: weights move every optimiser step.
//!
//! Gradients reach the latent parameters through the detached-delta form
//!
//! ```text
//! x_q = x_norm + (activation_quant(x_norm) - x_norm).detach()
//! w_q = w      + (weight_quant(w)          - w     ).detach()
//! ```
//!
//! whose forward value is the quantised tensor and whose Jacobian is the
//! identity.

use candle_core::{Error, Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use bitvit_common::BitVitConfig;

use crate::norm::standardize;
use crate::quantize::{activation_quant, matmul_reshape, ternary_distribution, weight_quant};

/// Linear transform `y = Q8(norm(x)) · Q3(W)ᵀ + b` with STE gradients.
pub struct QuantizedLinear {
    inner: Linear,
    in_features: usize,
    out_features: usize,
    norm_eps: f64,
}

impl QuantizedLinear {
    /// Layer with bias, standard linear initialisation.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: &BitVitConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner = candle_nn::linear(in_features, out_features, vb)?;
        Ok(Self::from_linear(inner, in_features, out_features, config.norm_eps))
    }

    /// Wrap existing tensors. `weight` is `(out_features, in_features)`.
    pub fn from_weights(weight: Tensor, bias: Option<Tensor>, norm_eps: f64) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        if let Some(b) = &bias {
            let len = b.dims1()?;
            if len != out_features {
                return Err(Error::Msg(format!(
                    "QuantizedLinear: bias length {len} does not match out_features {out_features}"
                )));
            }
        }
        Ok(Self::from_linear(
            Linear::new(weight, bias),
            in_features,
            out_features,
            norm_eps,
        ))
    }

    fn from_linear(inner: Linear, in_features: usize, out_features: usize, norm_eps: f64) -> Self {
        Self {
            inner,
            in_features,
            out_features,
            norm_eps,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Full-precision latent weight, `(out_features, in_features)`.
    pub fn weight(&self) -> &Tensor {
        self.inner.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.inner.bias()
    }

    /// Ternary weight with the identity gradient path to the latent weight.
    pub fn quantized_weight(&self) -> Result<Tensor> {
        let w = self.inner.weight();
        let delta = (weight_quant(w)? - w)?.detach();
        w + delta
    }

    /// Debug: count {-1, 0, +1} in the current ternary weight code.
    pub fn ternary_distribution(&self) -> Result<(u64, u64, u64)> {
        ternary_distribution(self.inner.weight())
    }

    /// Number of stored parameters (weight + bias).
    pub fn num_params(&self) -> usize {
        self.in_features * self.out_features
            + self.inner.bias().map(|b| b.elem_count()).unwrap_or(0)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_dim = x.dim(D::Minus1)?;
        if in_dim != self.in_features {
            return Err(Error::Msg(format!(
                "QuantizedLinear: expected last dim {}, got {} (input shape {:?})",
                self.in_features,
                in_dim,
                x.dims()
            )));
        }

        let x_norm = standardize(x, self.norm_eps)?;
        let x_delta = (activation_quant(&x_norm)? - &x_norm)?.detach();
        let x_q = (&x_norm + x_delta)?;
        let w_q = self.quantized_weight()?;

        let y = matmul_reshape(&x_q, &w_q.t()?)?;
        match self.inner.bias() {
            Some(b) => y.broadcast_add(b),
            None => Ok(y),
        }
    }
}

impl Module for QuantizedLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    const EPS: f64 = 1e-5;

    fn layer(in_dim: usize, out_dim: usize) -> (VarMap, QuantizedLinear) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let l = QuantizedLinear::new(in_dim, out_dim, &BitVitConfig::default(), vb.pp("proj"))
            .unwrap();
        (varmap, l)
    }

    fn to_flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn output_shape_preserves_leading_dims() {
        let (_vm, l) = layer(12, 5);
        for (b, t) in [(1, 1), (2, 7), (3, 16)] {
            let x = Tensor::randn(0f32, 1.0, (b, t, 12), &Device::Cpu).unwrap();
            assert_eq!(l.forward(&x).unwrap().dims(), &[b, t, 5]);
        }
        let x = Tensor::randn(0f32, 1.0, (4, 12), &Device::Cpu).unwrap();
        assert_eq!(l.forward(&x).unwrap().dims(), &[4, 5]);
    }

    #[test]
    fn wrong_input_width_is_rejected() {
        let (_vm, l) = layer(12, 5);
        let x = Tensor::randn(0f32, 1.0, (2, 3, 11), &Device::Cpu).unwrap();
        assert!(l.forward(&x).is_err());
    }

    #[test]
    fn registers_weight_and_bias() {
        let (varmap, l) = layer(8, 3);
        assert_eq!(varmap.all_vars().len(), 2);
        assert_eq!(l.num_params(), 8 * 3 + 3);
        assert_eq!(l.weight().dims(), &[3, 8]);
        assert_eq!(l.bias().unwrap().dims(), &[3]);
    }

    #[test]
    fn forward_matches_explicit_quantised_product() {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 0.5, (4, 6), &dev).unwrap();
        let b = Tensor::new(&[0.1f32, -0.2, 0.3, 0.0], &dev).unwrap();
        let l = QuantizedLinear::from_weights(w.clone(), Some(b.clone()), EPS).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 6), &dev).unwrap();

        let x_q = activation_quant(&standardize(&x, EPS).unwrap()).unwrap();
        let w_q = weight_quant(&w).unwrap();
        let expected = x_q
            .matmul(&w_q.t().unwrap())
            .unwrap()
            .broadcast_add(&b)
            .unwrap();

        let got = l.forward(&x).unwrap();
        for (g, e) in to_flat(&got).iter().zip(to_flat(&expected)) {
            assert!((g - e).abs() < 1e-4, "{g} vs {e}");
        }
    }

    #[test]
    fn gradients_pass_straight_through_to_latent_params() {
        let dev = Device::Cpu;
        let w = Var::from_tensor(&Tensor::randn(0f32, 0.5, (4, 6), &dev).unwrap()).unwrap();
        let b = Var::zeros(4, DType::F32, &dev).unwrap();
        let l = QuantizedLinear::from_weights(
            w.as_tensor().clone(),
            Some(b.as_tensor().clone()),
            EPS,
        )
        .unwrap();
        let x = Tensor::randn(0f32, 1.0, (5, 6), &dev).unwrap();

        let grads = l.forward(&x).unwrap().sum_all().unwrap().backward().unwrap();

        // d(sum y)/dW[o, i] = Σ_r x_q[r, i] for every o: the ternary step is
        // invisible to the gradient.
        let x_q = activation_quant(&standardize(&x, EPS).unwrap()).unwrap();
        let col_sums = to_flat(&x_q.sum(0).unwrap());
        let gw: Vec<Vec<f32>> = grads.get(w.as_tensor()).unwrap().to_vec2().unwrap();
        assert_eq!(gw.len(), 4);
        for row in gw {
            for (g, e) in row.iter().zip(&col_sums) {
                assert!((g - e).abs() < 1e-4, "{g} vs {e}");
            }
        }

        let gb = to_flat(grads.get(b.as_tensor()).unwrap());
        assert_eq!(gb, vec![5.0; 4]);
    }

    #[test]
    fn gradient_reaches_input() {
        let dev = Device::Cpu;
        let (_vm, l) = layer(6, 3);
        let x = Var::from_tensor(&Tensor::randn(0f32, 1.0, (2, 6), &dev).unwrap()).unwrap();
        let grads = l
            .forward(x.as_tensor())
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();
        let gx = grads.get(x.as_tensor()).unwrap();
        assert_eq!(gx.dims(), &[2, 6]);
        assert!(to_flat(gx).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn weights_are_requantised_every_forward() {
        let dev = Device::Cpu;
        let w = Var::from_tensor(&Tensor::randn(0f32, 0.5, (3, 4), &dev).unwrap()).unwrap();
        let l = QuantizedLinear::from_weights(w.as_tensor().clone(), None, EPS).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4), &dev).unwrap();

        let w_before = to_flat(w.as_tensor());
        let y1 = to_flat(&l.forward(&x).unwrap());
        assert_eq!(to_flat(w.as_tensor()), w_before, "forward must not mutate weights");

        w.set(&w.as_tensor().neg().unwrap()).unwrap();
        let y2 = to_flat(&l.forward(&x).unwrap());
        for (a, b) in y1.iter().zip(&y2) {
            assert!((a + b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn from_weights_checks_bias_length() {
        let dev = Device::Cpu;
        let w = Tensor::zeros((3, 4), DType::F32, &dev).unwrap();
        let b = Tensor::zeros(2, DType::F32, &dev).unwrap();
        assert!(QuantizedLinear::from_weights(w, Some(b), EPS).is_err());
    }
}
