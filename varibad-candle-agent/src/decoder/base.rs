use super::DecoderConfig;
use crate::{
    mlp::{FeatureExtractor, FeatureExtractorConfig, Mlp, MlpConfig},
    model::SubModel1,
    Activation,
};
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

/// Input of [`RewardDecoder`] and [`StateTransitionDecoder`].
///
/// All tensors share the leading dimensions.
#[derive(Debug, Clone)]
pub struct DecoderInput {
    /// Latent embedding.
    pub latent: Tensor,

    /// State before the transition.
    pub prev_state: Tensor,

    /// Action.
    pub action: Tensor,

    /// State after the transition.
    pub next_state: Tensor,
}

fn embedding(vb: VarBuilder, in_dim: usize, out_dim: usize) -> Result<FeatureExtractor> {
    FeatureExtractor::build(
        vb,
        FeatureExtractorConfig::new(in_dim, out_dim, Activation::ReLU),
    )
}

/// Concatenates the latent with the embeddings that are enabled.
fn concat(latent: &Tensor, embeddings: Vec<Option<Tensor>>) -> Result<Tensor> {
    let mut parts = vec![latent.clone()];
    parts.extend(embeddings.into_iter().flatten());
    Ok(Tensor::cat(&parts, D::Minus1)?)
}

/// Predicts the reward of a transition from the latent and the state reached.
pub struct RewardDecoder {
    state_encoder: FeatureExtractor,
    prev_state_encoder: Option<FeatureExtractor>,
    action_encoder: Option<FeatureExtractor>,
    mlp: Mlp,
}

impl SubModel1 for RewardDecoder {
    type Config = DecoderConfig;
    type Input = DecoderInput;
    type Output = Tensor;

    fn build(vb: VarBuilder, config: DecoderConfig) -> Result<Self> {
        let state_encoder = embedding(
            vb.pp("state_encoder"),
            config.state_dim,
            config.state_embed_dim,
        )?;
        let prev_state_encoder = match config.reward_input_prev_state {
            true => Some(embedding(
                vb.pp("prev_state_encoder"),
                config.state_dim,
                config.state_embed_dim,
            )?),
            false => None,
        };
        let action_encoder = match config.reward_input_action {
            true => Some(embedding(
                vb.pp("action_encoder"),
                config.action_dim,
                config.action_embed_dim,
            )?),
            false => None,
        };

        let in_dim = config.latent_dim
            + state_encoder.out_dim()
            + prev_state_encoder.as_ref().map_or(0, |e| e.out_dim())
            + action_encoder.as_ref().map_or(0, |e| e.out_dim());
        let mlp = Mlp::build(vb, MlpConfig::new(in_dim, config.reward_layers, 1, false))?;

        Ok(Self {
            state_encoder,
            prev_state_encoder,
            action_encoder,
            mlp,
        })
    }

    fn forward(&self, input: &DecoderInput) -> Result<Tensor> {
        let mut embeddings = vec![self.state_encoder.forward(&input.next_state)?];
        if let Some(enc) = &self.prev_state_encoder {
            embeddings.push(enc.forward(&input.prev_state)?);
        }
        if let Some(enc) = &self.action_encoder {
            embeddings.push(enc.forward(&input.action)?);
        }
        self.mlp.forward(&concat(&input.latent, embeddings)?)
    }
}

/// Predicts the next state from the latent, the previous state and the action.
pub struct StateTransitionDecoder {
    state_encoder: FeatureExtractor,
    action_encoder: FeatureExtractor,
    mlp: Mlp,
}

impl SubModel1 for StateTransitionDecoder {
    type Config = DecoderConfig;
    type Input = DecoderInput;
    type Output = Tensor;

    fn build(vb: VarBuilder, config: DecoderConfig) -> Result<Self> {
        let state_encoder = embedding(
            vb.pp("state_encoder"),
            config.state_dim,
            config.state_embed_dim,
        )?;
        let action_encoder = embedding(
            vb.pp("action_encoder"),
            config.action_dim,
            config.action_embed_dim,
        )?;
        let in_dim = config.latent_dim + state_encoder.out_dim() + action_encoder.out_dim();
        let mlp = Mlp::build(
            vb,
            MlpConfig::new(in_dim, config.state_layers, config.state_dim, false),
        )?;

        Ok(Self {
            state_encoder,
            action_encoder,
            mlp,
        })
    }

    fn forward(&self, input: &DecoderInput) -> Result<Tensor> {
        let embeddings = vec![
            self.state_encoder.forward(&input.prev_state)?,
            self.action_encoder.forward(&input.action)?,
        ];
        self.mlp.forward(&concat(&input.latent, embeddings)?)
    }
}

/// Predicts the task from the latent.
pub struct TaskDecoder {
    mlp: Mlp,
}

impl SubModel1 for TaskDecoder {
    type Config = DecoderConfig;
    type Input = Tensor;
    type Output = Tensor;

    fn build(vb: VarBuilder, config: DecoderConfig) -> Result<Self> {
        let mlp = Mlp::build(
            vb,
            MlpConfig::new(
                config.latent_dim,
                config.task_layers,
                config.task_dim,
                false,
            ),
        )?;
        Ok(Self { mlp })
    }

    fn forward(&self, latent: &Tensor) -> Result<Tensor> {
        self.mlp.forward(latent)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn input(dims: &[usize], config: &DecoderConfig) -> Result<DecoderInput> {
        let with = |d: usize| {
            let mut shape = dims.to_vec();
            shape.push(d);
            Tensor::zeros(shape, DType::F32, &Device::Cpu)
        };
        Ok(DecoderInput {
            latent: with(config.latent_dim)?,
            prev_state: with(config.state_dim)?,
            action: with(config.action_dim)?,
            next_state: with(config.state_dim)?,
        })
    }

    #[test]
    fn test_decoders_keep_leading_dims() -> Result<()> {
        let config = DecoderConfig::default()
            .latent_dim(3)
            .dims(2, 1, 2)
            .reward_inputs(true, true);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let reward = RewardDecoder::build(vb.pp("reward"), config.clone())?;
        let state = StateTransitionDecoder::build(vb.pp("state"), config.clone())?;
        let task = TaskDecoder::build(vb.pp("task"), config.clone())?;

        let xs = input(&[4, 3, 5], &config)?;
        assert_eq!(reward.forward(&xs)?.dims(), [4, 3, 5, 1]);
        assert_eq!(state.forward(&xs)?.dims(), [4, 3, 5, 2]);
        assert_eq!(task.forward(&xs.latent)?.dims(), [4, 3, 5, 2]);

        let xs = input(&[7], &config)?;
        assert_eq!(reward.forward(&xs)?.dims(), [7, 1]);
        Ok(())
    }
}
