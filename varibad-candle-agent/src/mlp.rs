//! Multilayer perceptron.
mod base;
mod config;
mod feature;
use anyhow::Result;
pub use base::Mlp;
use candle_core::Tensor;
pub use config::MlpConfig;
pub use feature::{FeatureExtractor, FeatureExtractorConfig};
use serde::{Deserialize, Serialize};

/// Activation functions of hidden layers.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub enum Activation {
    /// Rectified linear unit.
    ReLU,

    /// Hyperbolic tangent.
    Tanh,

    /// Identity.
    None,
}

impl Activation {
    /// Applies the activation function.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::ReLU => xs.relu()?,
            Self::Tanh => xs.tanh()?,
            Self::None => xs.clone(),
        })
    }
}
