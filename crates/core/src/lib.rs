//! # bitvit-core: the quantised Vision Transformer
//!
//! Every compute primitive needed to build and train a ViT whose linear
//! layers run on ternary weights and 8-bit activations:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | STE round/sign, 8-bit activation and ternary weight quantisers |
//! | [`norm`] | Parameter-free standardisation, optional affine `NormLayer` |
//! | [`linear`] | `QuantizedLinear` (standardise → quantise → matmul) |
//! | [`activation`] | GELU and the quantised `FeedForward` |
//! | [`attention`] | Full-precision `MultiHeadSelfAttention` |
//! | [`embedding`] | `PatchEmbedding` (patchify, class token, positional bias) |
//! | [`encoder`] | Pre-norm `EncoderBlock` |
//! | [`model`] | `BitVisionTransformer`, `ClassificationHead`, `CompressionStats` |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`
//!    and compiles to CPU, CUDA and Metal.
//! 2. **Latent weights stay full precision.** Quantisation happens on every
//!    forward; nothing quantised is cached.
//! 3. **Deterministic in eval mode.** Dropout is the only source of randomness.

pub mod activation;
pub mod attention;
pub mod embedding;
pub mod encoder;
pub mod linear;
pub mod model;
pub mod norm;
pub mod quantize;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use activation::{gelu, FeedForward};
pub use attention::MultiHeadSelfAttention;
pub use embedding::PatchEmbedding;
pub use encoder::EncoderBlock;
pub use linear::QuantizedLinear;
pub use model::{compression_stats, BitVisionTransformer, ClassificationHead, CompressionStats};
pub use norm::{standardize, NormLayer};
pub use quantize::{activation_quant, ste_round, ste_sign, ternary_distribution, weight_quant};
