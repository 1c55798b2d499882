//! Patch embedding: image → sequence of projected patches plus class token.
//!
//! ```text
//! (B, C, H, W) ─patchify→ (B, N, P²·C) ─QuantizedLinear→ (B, N, L)
//!              ─prepend class token→ (B, N+1, L) ─+ positional bias→ (B, N+1, L)
//! ```
//!
//! The positional bias is a single learned `L`-vector broadcast over every
//! position, class token included. It is not a per-position table.

use candle_core::{Error, Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};

use bitvit_common::BitVitConfig;

use crate::linear::QuantizedLinear;

const TOKEN_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 1.,
};

pub struct PatchEmbedding {
    projection: QuantizedLinear,
    /// `(1, 1, L)`, prepended at sequence index 0.
    class_token: Tensor,
    /// `(1, 1, L)`, added to every position.
    pos_embedding: Tensor,
    patch_size: usize,
    n_channels: usize,
    latent_size: usize,
}

impl PatchEmbedding {
    pub fn new(config: &BitVitConfig, vb: VarBuilder) -> Result<Self> {
        let latent = config.latent_size;
        let projection =
            QuantizedLinear::new(config.patch_dim(), latent, config, vb.pp("projection"))?;
        let class_token = vb.get_with_hints((1, 1, latent), "class_token", TOKEN_INIT)?;
        let pos_embedding = vb.get_with_hints((1, 1, latent), "pos_embedding", TOKEN_INIT)?;
        Ok(Self {
            projection,
            class_token,
            pos_embedding,
            patch_size: config.patch_size,
            n_channels: config.n_channels,
            latent_size: latent,
        })
    }

    /// Rearrange `(B, C, H, W)` into `(B, (H/P)·(W/P), P·P·C)`.
    ///
    /// Patches are ordered row-major over the patch grid; each flattened
    /// patch is ordered (row in patch, column in patch, channel).
    pub fn patchify(&self, images: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = images.dims4()?;
        let p = self.patch_size;
        if c != self.n_channels {
            return Err(Error::Msg(format!(
                "patch embedding expects {} channels, got {c}",
                self.n_channels
            )));
        }
        if h % p != 0 || w % p != 0 {
            return Err(Error::Msg(format!(
                "image {h}x{w} is not divisible into {p}x{p} patches"
            )));
        }
        let (nh, nw) = (h / p, w / p);
        images
            .reshape(vec![b, c, nh, p, nw, p])?
            .permute(vec![0, 2, 4, 3, 5, 1])?
            .contiguous()?
            .reshape((b, nh * nw, p * p * c))
    }

    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let patches = self.patchify(images)?;
        let projected = self.projection.forward(&patches)?;
        let b = projected.dim(0)?;
        let class_token = self
            .class_token
            .broadcast_as((b, 1, self.latent_size))?
            .contiguous()?;
        let tokens = Tensor::cat(&[&class_token, &projected], 1)?;
        tokens.broadcast_add(&self.pos_embedding)
    }

    pub fn projection(&self) -> &QuantizedLinear {
        &self.projection
    }

    pub fn class_token(&self) -> &Tensor {
        &self.class_token
    }

    pub fn pos_embedding(&self) -> &Tensor {
        &self.pos_embedding
    }
}

impl Module for PatchEmbedding {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        self.forward(images)
    }
}
