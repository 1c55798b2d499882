//! Model configuration for BitViT.
//!
//! Serialised as JSON alongside checkpoints. Every field has a default so a
//! minimal `{}` JSON produces a working ViT-Base-sized model.

use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Configuration for the quantization-aware Vision Transformer.
///
/// Constructed once (from JSON or CLI) and passed by reference into every
/// component that needs it. Sizes are fixed for the lifetime of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitVitConfig {
    // ── Input geometry ──────────────────────────────────────────────────────
    /// Side of the (square) images the model is configured for.
    pub image_size: usize,
    /// Input channels (3 for RGB).
    pub n_channels: usize,
    /// Side of the square, non-overlapping patches.
    pub patch_size: usize,

    // ── Core dimensions ─────────────────────────────────────────────────────
    /// Latent (embedding / attention / residual) width.
    pub latent_size: usize,
    /// Number of encoder blocks.
    pub num_encoders: usize,
    /// Number of attention heads. Must divide `latent_size`.
    pub num_heads: usize,
    /// Output logits width.
    pub num_classes: usize,
    /// Feed-forward expansion: hidden width = `mlp_ratio * latent_size`.
    pub mlp_ratio: usize,

    // ── Regularisation / numerics ───────────────────────────────────────────
    /// Dropout on attention weights and after each FFN projection.
    pub dropout: f32,
    /// Epsilon of every normalisation.
    pub norm_eps: f64,
    /// Give the encoder and head normalisation a learned scale and shift.
    /// The input normalisation inside quantized linear units stays
    /// parameter-free regardless.
    pub affine_norm: bool,

    // ── Placement ───────────────────────────────────────────────────────────
    /// Execution device.
    pub device: DeviceChoice,
}

impl Default for BitVitConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            n_channels: 3,
            patch_size: 16,
            latent_size: 768,
            num_encoders: 12,
            num_heads: 8,
            num_classes: 10,
            mlp_ratio: 4,
            dropout: 0.5,
            norm_eps: 1e-5,
            affine_norm: false,
            device: DeviceChoice::Auto,
        }
    }
}

impl BitVitConfig {
    /// Head dimension (`latent_size / num_heads`).
    pub fn head_dim(&self) -> usize {
        self.latent_size / self.num_heads.max(1)
    }

    /// Patches per image: `(image_size / patch_size)²`.
    pub fn num_patches(&self) -> usize {
        let side = self.image_size / self.patch_size.max(1);
        side * side
    }

    /// Length of a flattened patch: `patch_size² × n_channels`.
    pub fn patch_dim(&self) -> usize {
        self.patch_size * self.patch_size * self.n_channels
    }

    /// Hidden width of the encoder feed-forward network.
    pub fn mlp_hidden_size(&self) -> usize {
        self.mlp_ratio * self.latent_size
    }

    /// Check cross-field constraints. Call before building a model.
    pub fn validate(&self) -> anyhow::Result<()> {
        let sizes = [
            ("image_size", self.image_size),
            ("n_channels", self.n_channels),
            ("patch_size", self.patch_size),
            ("latent_size", self.latent_size),
            ("num_heads", self.num_heads),
            ("num_classes", self.num_classes),
            ("mlp_ratio", self.mlp_ratio),
        ];
        for (name, value) in sizes {
            if value == 0 {
                anyhow::bail!("{name} must be non-zero");
            }
        }
        if self.latent_size % self.num_heads != 0 {
            anyhow::bail!(
                "latent_size ({}) must be divisible by num_heads ({})",
                self.latent_size,
                self.num_heads
            );
        }
        if self.image_size % self.patch_size != 0 {
            anyhow::bail!(
                "image_size ({}) must be divisible by patch_size ({})",
                self.image_size,
                self.patch_size
            );
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.norm_eps <= 0.0 {
            anyhow::bail!("norm_eps must be positive, got {}", self.norm_eps);
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }
}

// ── Device selection ────────────────────────────────────────────────────────

/// Where tensors live. Orthogonal to the model math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    Cpu,
    Cuda,
    Metal,
    /// CUDA device 0 when available, otherwise CPU.
    #[default]
    Auto,
}

impl DeviceChoice {
    /// Resolve to a candle [`Device`].
    pub fn resolve(self) -> candle_core::Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => Device::new_cuda(0),
            Self::Metal => Device::new_metal(0),
            Self::Auto => Device::cuda_if_available(0),
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "auto" => Ok(Self::Auto),
            other => anyhow::bail!("unknown device '{other}' (expected cpu, cuda, metal or auto)"),
        }
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Auto => "auto",
        };
        f.write_str(s)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
