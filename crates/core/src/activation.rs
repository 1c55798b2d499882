//! Activation and the quantised feed-forward network of an encoder block.
//!
//! ```text
//! out = dropout( fc2( dropout( GELU( fc1(x) ) ) ) )
//! ```
//!
//! `fc1` expands `latent → mlp_ratio × latent`, `fc2` projects back. Both are
//! [`QuantizedLinear`] units.

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, ModuleT, VarBuilder};

use bitvit_common::BitVitConfig;

use crate::linear::QuantizedLinear;

/// Exact (erf-based) GELU.
#[inline]
pub fn gelu(x: &Tensor) -> Result<Tensor> {
    x.gelu_erf()
}

/// Two-projection quantised MLP with GELU and dropout.
pub struct FeedForward {
    fc1: QuantizedLinear,
    fc2: QuantizedLinear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(config: &BitVitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.mlp_hidden_size();
        let fc1 = QuantizedLinear::new(config.latent_size, hidden, config, vb.pp("fc1"))?;
        let fc2 = QuantizedLinear::new(hidden, config.latent_size, config, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            dropout: Dropout::new(config.dropout),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = gelu(&self.fc1.forward(x)?)?;
        let h = self.dropout.forward(&h, train)?;
        let out = self.fc2.forward(&h)?;
        self.dropout.forward(&out, train)
    }

    /// Named quantised projections, for diagnostics.
    pub fn projections(&self) -> [(&'static str, &QuantizedLinear); 2] {
        [("fc1", &self.fc1), ("fc2", &self.fc2)]
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(x, train)
    }
}
