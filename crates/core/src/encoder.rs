//! Pre-norm transformer encoder block.
//!
//! ```text
//! r   = x + MHSA( norm(x) )
//! out = r + FFN( norm(r) )
//! ```
//!
//! Both normalisation points go through the **same** [`NormLayer`] instance,
//! so with `affine_norm` they share one scale/shift parameter set.

use candle_core::{Error, Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};

use bitvit_common::BitVitConfig;

use crate::activation::FeedForward;
use crate::attention::MultiHeadSelfAttention;
use crate::linear::QuantizedLinear;
use crate::norm::NormLayer;

pub struct EncoderBlock {
    norm: NormLayer,
    attn: MultiHeadSelfAttention,
    mlp: FeedForward,
    latent_size: usize,
}

impl EncoderBlock {
    pub fn new(config: &BitVitConfig, vb: VarBuilder) -> Result<Self> {
        let norm = NormLayer::new(config, vb.pp("norm"))?;
        let attn = MultiHeadSelfAttention::new(config, vb.pp("attn"))?;
        let mlp = FeedForward::new(config, vb.pp("mlp"))?;
        Ok(Self {
            norm,
            attn,
            mlp,
            latent_size: config.latent_size,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (_, _, c) = x.dims3()?;
        if c != self.latent_size {
            return Err(Error::Msg(format!(
                "encoder block expects latent dim {}, got {c}",
                self.latent_size
            )));
        }

        // Attention sub-layer
        let normed = self.norm.forward(x)?;
        let attn_out = self.attn.forward_t(&normed, train)?;
        let residual = (x + attn_out)?;

        // FFN sub-layer, same norm instance
        let normed = self.norm.forward(&residual)?;
        let mlp_out = self.mlp.forward_t(&normed, train)?;
        residual + mlp_out
    }

    /// Quantised projections of the feed-forward network, named under `prefix`.
    pub fn quantized_layers(&self, prefix: &str) -> Vec<(String, &QuantizedLinear)> {
        self.mlp
            .projections()
            .into_iter()
            .map(|(name, layer)| (format!("{prefix}.mlp.{name}"), layer))
            .collect()
    }
}

impl ModuleT for EncoderBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(x, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config(affine_norm: bool) -> BitVitConfig {
        BitVitConfig {
            latent_size: 32,
            num_heads: 4,
            dropout: 0.1,
            affine_norm,
            ..Default::default()
        }
    }

    fn build(config: &BitVitConfig) -> (VarMap, EncoderBlock) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = EncoderBlock::new(config, vb.pp("encoder.0")).unwrap();
        (varmap, block)
    }

    #[test]
    fn output_shape_equals_input_shape() {
        let (_vm, block) = build(&config(false));
        for (b, t) in [(1, 1), (2, 5), (3, 17)] {
            let x = Tensor::randn(0f32, 1.0, (b, t, 32), &Device::Cpu).unwrap();
            assert_eq!(block.forward_t(&x, true).unwrap().dims(), &[b, t, 32]);
            assert_eq!(block.forward_t(&x, false).unwrap().dims(), &[b, t, 32]);
        }
    }

    #[test]
    fn wrong_latent_width_fails() {
        let (_vm, block) = build(&config(false));
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu).unwrap();
        assert!(block.forward_t(&x, false).is_err());
    }

    #[test]
    fn both_norm_points_share_one_parameter_set() {
        let (varmap, _block) = build(&config(true));
        let data = varmap.data().lock().unwrap();
        let norm_vars: Vec<&String> = data.keys().filter(|k| k.contains(".norm.")).collect();
        assert_eq!(norm_vars.len(), 2, "{norm_vars:?}");
        assert!(data.contains_key("encoder.0.norm.weight"));
        assert!(data.contains_key("encoder.0.norm.bias"));
    }

    #[test]
    fn lists_quantized_projections() {
        let (_vm, block) = build(&config(false));
        let names: Vec<String> = block
            .quantized_layers("encoder.0")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["encoder.0.mlp.fc1", "encoder.0.mlp.fc2"]);
    }
}
