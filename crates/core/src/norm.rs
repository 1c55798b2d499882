//! Normalisation layers.
//!
//! The quantized linear units normalise their input with a parameter-free
//! standardisation (zero mean, unit variance, no scale or shift). This stands
//! in for RMSNorm; it subtracts the mean, so it is not numerically equivalent
//! and must not be swapped for a true RMSNorm.
//!
//! Encoder blocks and the classification head use [`NormLayer`], which is the
//! same standardisation with an optional learned affine transform.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

use bitvit_common::BitVitConfig;

/// `(x - mean) / sqrt(var + eps)` over the last dimension (biased variance).
pub fn standardize(x: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered.broadcast_div(&(var + eps)?.sqrt()?)
}

/// Normalisation over the last (latent) dimension.
pub enum NormLayer {
    /// Standardisation only.
    ParameterFree { eps: f64 },
    /// Standardisation followed by a learned per-feature scale and shift.
    Affine {
        weight: Tensor,
        bias: Tensor,
        eps: f64,
    },
}

impl NormLayer {
    /// Construct from config. `vb` should be scoped to the layer prefix
    /// (e.g. `vb.pp("norm")`); it is only touched when `affine_norm` is set.
    pub fn new(config: &BitVitConfig, vb: VarBuilder) -> Result<Self> {
        if config.affine_norm {
            let size = config.latent_size;
            let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
            let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
            Ok(Self::Affine {
                weight,
                bias,
                eps: config.norm_eps,
            })
        } else {
            Ok(Self::ParameterFree {
                eps: config.norm_eps,
            })
        }
    }

    pub fn parameter_free(eps: f64) -> Self {
        Self::ParameterFree { eps }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::ParameterFree { eps } => standardize(x, *eps),
            Self::Affine { weight, bias, eps } => standardize(x, *eps)?
                .broadcast_mul(weight)?
                .broadcast_add(bias),
        }
    }
}

impl Module for NormLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn standardize_rows_have_zero_mean_unit_variance() {
        let dev = Device::Cpu;
        let x = Tensor::randn(3f32, 5.0, (4, 64), &dev).unwrap();
        let y = standardize(&x, 1e-5).unwrap();
        let mean: Vec<f32> = y.mean_keepdim(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let var: Vec<f32> = y.sqr().unwrap().mean_keepdim(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for m in mean {
            assert!(m.abs() < 1e-4);
        }
        for v in var {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn standardize_constant_row_is_finite() {
        let dev = Device::Cpu;
        let x = Tensor::full(2.5f32, (2, 8), &dev).unwrap();
        let y: Vec<Vec<f32>> = standardize(&x, 1e-5).unwrap().to_vec2().unwrap();
        assert!(y.iter().flatten().all(|&v| v == 0.0));
    }

    #[test]
    fn parameter_free_norm_registers_no_vars() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = BitVitConfig::default();
        let _ = NormLayer::new(&config, vb.pp("norm")).unwrap();
        assert!(varmap.all_vars().is_empty());
    }

    #[test]
    fn affine_norm_starts_as_identity_affine() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = BitVitConfig {
            latent_size: 16,
            affine_norm: true,
            ..Default::default()
        };
        let norm = NormLayer::new(&config, vb.pp("norm")).unwrap();
        assert_eq!(varmap.all_vars().len(), 2);

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &dev).unwrap();
        let a: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = standardize(&x, config.norm_eps).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
