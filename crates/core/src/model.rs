//! Vision Transformer with quantised linear layers.
//!
//! ```text
//! images ─PatchEmbedding→ (B, N+1, L) ─N × EncoderBlock→ (B, N+1, L)
//!        ─take index 0 (class token)→ (B, L) ─ClassificationHead→ (B, classes)
//! ```

use candle_core::{Error, IndexOp, Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};

use bitvit_common::BitVitConfig;

use crate::activation::gelu;
use crate::embedding::PatchEmbedding;
use crate::encoder::EncoderBlock;
use crate::linear::QuantizedLinear;
use crate::norm::NormLayer;

// ── Classification head ─────────────────────────────────────────────────────

/// `norm → QuantizedLinear(L→L) → GELU → QuantizedLinear(L→classes)`.
pub struct ClassificationHead {
    norm: NormLayer,
    fc1: QuantizedLinear,
    fc2: QuantizedLinear,
}

impl ClassificationHead {
    pub fn new(config: &BitVitConfig, vb: VarBuilder) -> Result<Self> {
        let latent = config.latent_size;
        let norm = NormLayer::new(config, vb.pp("norm"))?;
        let fc1 = QuantizedLinear::new(latent, latent, config, vb.pp("fc1"))?;
        let fc2 = QuantizedLinear::new(latent, config.num_classes, config, vb.pp("fc2"))?;
        Ok(Self { norm, fc1, fc2 })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.norm.forward(x)?;
        let h = gelu(&self.fc1.forward(&h)?)?;
        self.fc2.forward(&h)
    }
}

// ── BitVisionTransformer ────────────────────────────────────────────────────

/// Patch embedding, encoder stack and classification head.
///
/// All parameters live in the `VarMap` behind the `VarBuilder` passed to
/// [`BitVisionTransformer::new`]; an external optimiser updates them there.
pub struct BitVisionTransformer {
    embedding: PatchEmbedding,
    encoders: Vec<EncoderBlock>,
    head: ClassificationHead,
    config: BitVitConfig,
}

impl BitVisionTransformer {
    pub fn new(vb: VarBuilder, config: &BitVitConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Msg(format!("invalid model config: {e}")))?;

        let embedding = PatchEmbedding::new(config, vb.pp("embedding"))?;
        let mut encoders = Vec::with_capacity(config.num_encoders);
        for i in 0..config.num_encoders {
            encoders.push(EncoderBlock::new(config, vb.pp(format!("encoders.{i}")))?);
        }
        let head = ClassificationHead::new(config, vb.pp("head"))?;

        Ok(Self {
            embedding,
            encoders,
            head,
            config: config.clone(),
        })
    }

    /// `(B, C, H, W)` images → `(B, num_classes)` logits.
    ///
    /// `train` enables dropout; evaluation mode is deterministic.
    pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = self.embedding.forward(images)?;
        for block in &self.encoders {
            x = block.forward_t(&x, train)?;
        }
        let cls = x.i((.., 0))?;
        self.head.forward(&cls)
    }

    pub fn config(&self) -> &BitVitConfig {
        &self.config
    }

    pub fn num_encoders(&self) -> usize {
        self.encoders.len()
    }

    /// Every quantised linear unit with its parameter path.
    pub fn quantized_layers(&self) -> Vec<(String, &QuantizedLinear)> {
        let mut out = vec![(
            "embedding.projection".to_string(),
            self.embedding.projection(),
        )];
        for (i, block) in self.encoders.iter().enumerate() {
            out.extend(block.quantized_layers(&format!("encoders.{i}")));
        }
        out.push(("head.fc1".to_string(), &self.head.fc1));
        out.push(("head.fc2".to_string(), &self.head.fc2));
        out
    }

    /// Collect ternary weight distributions for all quantised layers (debug).
    pub fn weight_distributions(&self) -> Result<Vec<(String, String)>> {
        self.quantized_layers()
            .into_iter()
            .map(|(name, layer)| {
                let (neg, zero, pos) = layer.ternary_distribution()?;
                Ok((name, format!("ternary -1:{neg} 0:{zero} +1:{pos}")))
            })
            .collect()
    }
}

impl ModuleT for BitVisionTransformer {
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(images, train)
    }
}

// ── Compression Stats ───────────────────────────────────────────────────────

/// Approximate parameter counts and compression statistics.
///
/// Computed from config alone (no model instance needed).
#[derive(Debug, Clone)]
pub struct CompressionStats {
    pub total_params: usize,
    /// Weights of quantised linear units (biases stay full precision).
    pub quantized_params: usize,
    /// Effective bits per weight: (quant×2 + full×32) / total.
    pub effective_bits_per_param: f64,
    /// Compression ratio vs FP32.
    pub compression_ratio_vs_f32: f64,
}

/// Compute parameter counts and compression ratio from config.
///
/// Ternary weights are counted at 2 bits (packed storage), everything else
/// at 32.
pub fn compression_stats(config: &BitVitConfig) -> CompressionStats {
    let l = config.latent_size;
    let hidden = config.mlp_hidden_size();
    let classes = config.num_classes;
    let norm = if config.affine_norm { 2 * l } else { 0 };

    // Embedding: projection (w + b), class token, positional bias.
    let embed_q = config.patch_dim() * l;
    let embed_full = l + 2 * l;

    // Encoder: attention in/out projections (full precision) + norm,
    // quantised FFN weights with full-precision biases.
    let attn = (l * 3 * l + 3 * l) + (l * l + l);
    let ffn_q = l * hidden + hidden * l;
    let ffn_bias = hidden + l;
    let block_full = attn + ffn_bias + norm;

    // Head: norm, fc1 (L→L), fc2 (L→classes).
    let head_q = l * l + l * classes;
    let head_full = norm + l + classes;

    let n = config.num_encoders;
    let quantized = embed_q + n * ffn_q + head_q;
    let full = embed_full + n * block_full + head_full;
    let total = quantized + full;

    let bits_quantized = 2.0;
    let bits_full = 32.0;
    let effective_bits =
        (quantized as f64 * bits_quantized + full as f64 * bits_full) / total.max(1) as f64;

    CompressionStats {
        total_params: total,
        quantized_params: quantized,
        effective_bits_per_param: effective_bits,
        compression_ratio_vs_f32: bits_full / effective_bits,
    }
}
