//! Multi-head self-attention over the sequence axis.
//!
//! Standard scaled dot-product attention with full-precision projections:
//! a fused Q/K/V input projection (`latent → 3 × latent`, with bias), an
//! output projection, and dropout on the attention weights while training.
//! No mask: every position (class token included) attends to every other.
//!
//! Tensors are batch-first: `(batch, seq, latent)`.

use candle_core::{Error, IndexOp, Result, Tensor, D};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder};

use bitvit_common::BitVitConfig;

/// Multi-head self-attention with dropout on the attention weights.
pub struct MultiHeadSelfAttention {
    in_proj: Linear,
    out_proj: Linear,
    attn_dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadSelfAttention {
    pub fn new(config: &BitVitConfig, vb: VarBuilder) -> Result<Self> {
        let latent = config.latent_size;
        let num_heads = config.num_heads;
        if num_heads == 0 || latent % num_heads != 0 {
            return Err(Error::Msg(format!(
                "latent_size ({latent}) must be divisible by num_heads ({num_heads})"
            )));
        }
        let head_dim = latent / num_heads;

        let in_proj = candle_nn::linear(latent, 3 * latent, vb.pp("in_proj"))?;
        let out_proj = candle_nn::linear(latent, latent, vb.pp("out_proj"))?;

        Ok(Self {
            in_proj,
            out_proj,
            attn_dropout: Dropout::new(config.dropout),
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        if c != self.num_heads * self.head_dim {
            return Err(Error::Msg(format!(
                "attention expects latent dim {}, got {c}",
                self.num_heads * self.head_dim
            )));
        }

        // Fused QKV projection
        let qkv = self.in_proj.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 3, 1, 4, 2))?; // (b, heads, t, head_dim, 3)

        let q = qkv.i((.., .., .., .., 0))?.contiguous()?;
        let k = qkv.i((.., .., .., .., 1))?.contiguous()?;
        let v = qkv.i((.., .., .., .., 2))?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let att = self.attn_dropout.forward(&att, train)?;

        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?; // (b, t, heads, head_dim)
        let y = y.flatten(2, 3)?; // (b, t, c)
        self.out_proj.forward(&y)
    }
}

impl ModuleT for MultiHeadSelfAttention {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(x, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config(dropout: f32) -> BitVitConfig {
        BitVitConfig {
            latent_size: 32,
            num_heads: 4,
            dropout,
            ..Default::default()
        }
    }

    fn build(config: &BitVitConfig) -> (VarMap, MultiHeadSelfAttention) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadSelfAttention::new(config, vb.pp("attn")).unwrap();
        (varmap, attn)
    }

    fn to_flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn output_shape_matches_input() {
        let (_vm, attn) = build(&config(0.0));
        let x = Tensor::randn(0f32, 1.0, (2, 9, 32), &Device::Cpu).unwrap();
        assert_eq!(attn.forward_t(&x, false).unwrap().dims(), &[2, 9, 32]);
        assert_eq!(attn.num_heads(), 4);
    }

    #[test]
    fn rejects_heads_not_dividing_latent() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let bad = BitVitConfig {
            latent_size: 30,
            num_heads: 4,
            ..Default::default()
        };
        assert!(MultiHeadSelfAttention::new(&bad, vb).is_err());
    }

    #[test]
    fn batch_items_are_independent() {
        let dev = Device::Cpu;
        let (_vm, attn) = build(&config(0.0));
        let x = Tensor::randn(0f32, 1.0, (2, 5, 32), &dev).unwrap();
        let both = attn.forward_t(&x, false).unwrap();
        let first_alone = attn.forward_t(&x.narrow(0, 0, 1).unwrap(), false).unwrap();
        let first_in_batch = both.narrow(0, 0, 1).unwrap();
        for (a, b) in to_flat(&first_alone).iter().zip(to_flat(&first_in_batch)) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn eval_mode_is_deterministic_and_train_mode_drops() {
        let dev = Device::Cpu;
        let (_vm, attn) = build(&config(0.5));
        let x = Tensor::randn(0f32, 1.0, (2, 6, 32), &dev).unwrap();
        let a = to_flat(&attn.forward_t(&x, false).unwrap());
        let b = to_flat(&attn.forward_t(&x, false).unwrap());
        assert_eq!(a, b);

        let t = to_flat(&attn.forward_t(&x, true).unwrap());
        assert_ne!(a, t);
    }
}
