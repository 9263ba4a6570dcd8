use crate::{model::SubModel1, Activation};
use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`FeatureExtractor`].
pub struct FeatureExtractorConfig {
    /// Input dimension.
    pub in_dim: usize,

    /// Output dimension, `0` disables the extractor.
    pub out_dim: usize,

    /// Activation function.
    pub activation: Activation,
}

impl FeatureExtractorConfig {
    /// Creates the configuration.
    pub fn new(in_dim: usize, out_dim: usize, activation: Activation) -> Self {
        Self {
            in_dim,
            out_dim,
            activation,
        }
    }
}

/// Linear embedding followed by an activation, used for states, actions and rewards.
///
/// With zero output dimension the extractor has no parameters and returns `None`.
pub struct FeatureExtractor {
    fc: Option<Linear>,
    activation: Activation,
}

impl FeatureExtractor {
    /// Output dimension.
    pub fn out_dim(&self) -> usize {
        self.fc
            .as_ref()
            .map(|fc| fc.weight().dims()[0])
            .unwrap_or(0)
    }
}

impl SubModel1 for FeatureExtractor {
    type Config = FeatureExtractorConfig;
    type Input = Tensor;
    type Output = Option<Tensor>;

    fn build(vb: VarBuilder, config: Self::Config) -> Result<Self> {
        let fc = match config.out_dim {
            0 => None,
            n => Some(linear(config.in_dim, n, vb.pp("fc"))?),
        };
        Ok(Self {
            fc,
            activation: config.activation,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Option<Tensor>> {
        match &self.fc {
            None => Ok(None),
            Some(fc) => Ok(Some(self.activation.forward(&fc.forward(xs)?)?)),
        }
    }
}
