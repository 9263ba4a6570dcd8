use super::PolicyConfig;
use crate::{
    mlp::{FeatureExtractor, FeatureExtractorConfig, Mlp, MlpConfig},
    model::SubModel1,
    util::{param_stats, randn},
};
use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{linear, ops::log_softmax, Init, Linear, VarBuilder, VarMap};
use log::info;
use rand::{rngs::SmallRng, Rng};
use std::path::Path;
use varibad_core::{error::VaribadError, record::Record, ActionSpace};

/// Inputs of [`ActorCritic`], each `[batch, dim]`.
///
/// Only the inputs enabled in [`PolicyConfig`] are used and they must be present.
#[derive(Debug, Clone, Default)]
pub struct PolicyInput {
    /// States.
    pub state: Option<Tensor>,

    /// Ground-truth beliefs.
    pub belief: Option<Tensor>,

    /// Ground-truth tasks.
    pub task: Option<Tensor>,

    /// Latent embeddings.
    pub latent: Option<Tensor>,
}

enum ActionHead {
    Categorical(Linear),
    Gaussian { fc_mean: Linear, logstd: Tensor },
}

/// Actor-critic with separate actor and critic trunks.
///
/// The enabled inputs are optionally embedded and concatenated. Discrete action spaces
/// use a categorical head, continuous ones a diagonal Gaussian with a learned,
/// state-independent log standard deviation.
pub struct ActorCritic {
    config: PolicyConfig,
    device: Device,
    varmap: VarMap,
    state_encoder: FeatureExtractor,
    belief_encoder: FeatureExtractor,
    task_encoder: FeatureExtractor,
    latent_encoder: FeatureExtractor,
    actor: Mlp,
    critic: Mlp,
    critic_linear: Linear,
    head: ActionHead,
}

fn input_encoder(
    vb: VarBuilder,
    pass: bool,
    in_dim: usize,
    embed_dim: usize,
) -> Result<(FeatureExtractor, usize)> {
    let out_dim = if pass { embed_dim } else { 0 };
    let enc = FeatureExtractor::build(
        vb,
        FeatureExtractorConfig::new(in_dim, out_dim, crate::Activation::ReLU),
    )?;
    let dim = match (pass, embed_dim) {
        (false, _) => 0,
        (true, 0) => in_dim,
        (true, d) => d,
    };
    Ok((enc, dim))
}

/// Samples one index per row of `probs`, `[batch, 1]`.
fn sample_categorical(probs: &Tensor, rng: &mut SmallRng) -> Result<Tensor> {
    let probs = probs.to_vec2::<f32>()?;
    let n = probs.len();
    let actions: Vec<u32> = probs
        .iter()
        .map(|p| {
            let u: f32 = rng.gen();
            let mut acc = 0f32;
            for (i, &pi) in p.iter().enumerate() {
                acc += pi;
                if u < acc {
                    return i as u32;
                }
            }
            (p.len() - 1) as u32
        })
        .collect();
    Ok(Tensor::from_vec(actions, (n, 1), &Device::Cpu)?)
}

fn gaussian_log_prob(mean: &Tensor, logstd: &Tensor, x: &Tensor) -> Result<Tensor> {
    let logstd = logstd.broadcast_as(mean.shape())?;
    let var = (&logstd * 2.0)?.exp()?;
    let lp = ((((x - mean)?.sqr()? / (var * 2.0)?)?.neg()? - &logstd)?
        - 0.5 * (2.0 * std::f64::consts::PI).ln())?;
    Ok(lp.sum_keepdim(D::Minus1)?)
}

impl ActorCritic {
    /// Constructs [`ActorCritic`] with its own [`VarMap`].
    pub fn build(config: PolicyConfig, device: &Device) -> Result<Self> {
        if !(config.pass_state || config.pass_belief || config.pass_task || config.pass_latent) {
            return Err(VaribadError::ConfigError("the policy has no input".into()).into());
        }
        let (hidden, last) = match config.layers.split_last() {
            Some((last, hidden)) => (hidden.to_vec(), *last),
            None => {
                return Err(
                    VaribadError::ConfigError("the policy needs a hidden layer".into()).into(),
                )
            }
        };

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let (state_encoder, d1) = input_encoder(
            vb.pp("state_encoder"),
            config.pass_state,
            config.state_dim,
            config.state_embed_dim,
        )?;
        let (belief_encoder, d2) = input_encoder(
            vb.pp("belief_encoder"),
            config.pass_belief,
            config.belief_dim,
            config.belief_embed_dim,
        )?;
        let (task_encoder, d3) = input_encoder(
            vb.pp("task_encoder"),
            config.pass_task,
            config.task_dim,
            config.task_embed_dim,
        )?;
        let (latent_encoder, d4) = input_encoder(
            vb.pp("latent_encoder"),
            config.pass_latent,
            config.latent_dim,
            config.latent_embed_dim,
        )?;
        let in_dim = d1 + d2 + d3 + d4;

        let trunk = MlpConfig::new(in_dim, hidden, last, true).activation(config.activation);
        let actor = Mlp::build(vb.pp("actor"), trunk.clone())?;
        let critic = Mlp::build(vb.pp("critic"), trunk)?;
        let critic_linear = linear(last, 1, vb.pp("critic_linear"))?;
        let head = match &config.action_space {
            ActionSpace::Discrete(n) => ActionHead::Categorical(linear(last, *n, vb.pp("dist"))?),
            ActionSpace::Box { low, .. } => ActionHead::Gaussian {
                fc_mean: linear(last, low.len(), vb.pp("dist").pp("fc_mean"))?,
                logstd: vb.pp("dist").get_with_hints(
                    (1, low.len()),
                    "logstd",
                    Init::Const(config.init_std.ln()),
                )?,
            },
        };

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            state_encoder,
            belief_encoder,
            task_encoder,
            latent_encoder,
            actor,
            critic,
            critic_linear,
            head,
        })
    }

    fn features(&self, input: &PolicyInput) -> Result<Tensor> {
        let inputs = [
            (self.config.pass_state, &input.state, &self.state_encoder, "state"),
            (self.config.pass_belief, &input.belief, &self.belief_encoder, "belief"),
            (self.config.pass_task, &input.task, &self.task_encoder, "task"),
            (self.config.pass_latent, &input.latent, &self.latent_encoder, "latent"),
        ];

        let mut parts = vec![];
        for &(pass, x, encoder, name) in inputs.iter() {
            if !pass {
                continue;
            }
            let x = x.as_ref().ok_or_else(|| {
                VaribadError::ConfigError(format!("policy input {} is missing", name))
            })?;
            let x = x.to_device(&self.device)?;
            match encoder.forward(&x)? {
                Some(h) => parts.push(h),
                None => parts.push(x),
            }
        }
        Ok(Tensor::cat(&parts, D::Minus1)?)
    }

    fn value_and_actor_features(&self, input: &PolicyInput) -> Result<(Tensor, Tensor)> {
        let xs = self.features(input)?;
        let value = self.critic_linear.forward(&self.critic.forward(&xs)?)?;
        let h = self.actor.forward(&xs)?;
        Ok((value, h))
    }

    /// Value estimates `[batch, 1]`.
    pub fn get_value(&self, input: &PolicyInput) -> Result<Tensor> {
        let xs = self.features(input)?;
        Ok(self.critic_linear.forward(&self.critic.forward(&xs)?)?)
    }

    /// Returns values `[batch, 1]`, actions `[batch, action_dim]` and their
    /// log-probabilities `[batch, 1]`.
    ///
    /// Discrete actions are indices stored as floats. With `deterministic`, the mode of
    /// the action distribution is taken.
    pub fn act(
        &self,
        input: &PolicyInput,
        deterministic: bool,
        rng: &mut SmallRng,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (value, h) = self.value_and_actor_features(input)?;

        match &self.head {
            ActionHead::Categorical(fc) => {
                let logits = fc.forward(&h)?;
                let log_probs = log_softmax(&logits, D::Minus1)?;
                let action = match deterministic {
                    true => logits.argmax_keepdim(D::Minus1)?,
                    false => sample_categorical(&log_probs.exp()?, rng)?.to_device(&self.device)?,
                };
                let logp = log_probs.gather(&action, D::Minus1)?;
                Ok((value, action.to_dtype(DType::F32)?, logp))
            }
            ActionHead::Gaussian { fc_mean, logstd } => {
                let mean = fc_mean.forward(&h)?;
                let action = match deterministic {
                    true => mean.clone(),
                    false => {
                        let std = logstd.exp()?.broadcast_as(mean.shape())?;
                        let eps = randn(mean.dims(), &self.device, rng)?;
                        (&mean + (std * eps)?)?
                    }
                };
                let logp = gaussian_log_prob(&mean, logstd, &action)?;
                Ok((value, action, logp))
            }
        }
    }

    /// Returns values `[batch, 1]`, log-probabilities `[batch, 1]` of the given actions
    /// and the mean entropy of the action distribution.
    pub fn evaluate_actions(
        &self,
        input: &PolicyInput,
        actions: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (value, h) = self.value_and_actor_features(input)?;

        match &self.head {
            ActionHead::Categorical(fc) => {
                let log_probs = log_softmax(&fc.forward(&h)?, D::Minus1)?;
                let index = actions.to_dtype(DType::U32)?.contiguous()?;
                let logp = log_probs.gather(&index, D::Minus1)?;
                let entropy = (log_probs.exp()? * &log_probs)?
                    .sum(D::Minus1)?
                    .neg()?
                    .mean_all()?;
                Ok((value, logp, entropy))
            }
            ActionHead::Gaussian { fc_mean, logstd } => {
                let mean = fc_mean.forward(&h)?;
                let logp = gaussian_log_prob(&mean, logstd, actions)?;
                let entropy =
                    (logstd + (0.5 + 0.5 * (2.0 * std::f64::consts::PI).ln()))?.sum_all()?;
                Ok((value, logp, entropy))
            }
        }
    }

    /// Configuration.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Trainable variables.
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Mean parameter value, recorded as `weights/policy`.
    pub fn param_stats(&self) -> Result<Record> {
        param_stats(&self.varmap, "policy")
    }

    /// Saves the parameters to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path.as_ref())?;
        info!("Save policy to {:?}", path.as_ref());
        Ok(())
    }

    /// Loads the parameters from a safetensors file.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.load(path.as_ref())?;
        info!("Load policy from {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;

    fn input(n: usize) -> Result<PolicyInput> {
        Ok(PolicyInput {
            state: Some(Tensor::ones((n, 2), DType::F32, &Device::Cpu)?),
            belief: None,
            task: None,
            latent: Some(Tensor::zeros((n, 6), DType::F32, &Device::Cpu)?),
        })
    }

    fn config() -> PolicyConfig {
        PolicyConfig::default()
            .pass(true, false, false, true)
            .dims(2, 0, 0, 6)
            .layers(vec![16, 16])
    }

    #[test]
    fn test_categorical_policy() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let policy = ActorCritic::build(config().action_space(ActionSpace::Discrete(5)), &Device::Cpu)?;
        let xs = input(4)?;

        let (value, action, logp) = policy.act(&xs, false, &mut rng)?;
        assert_eq!(value.dims(), [4, 1]);
        assert_eq!(action.dims(), [4, 1]);
        assert_eq!(logp.dims(), [4, 1]);
        for a in action.flatten_all()?.to_vec1::<f32>()? {
            assert!((0.0..5.0).contains(&a) && a.fract() == 0.0);
        }

        let (_, logp_eval, entropy) = policy.evaluate_actions(&xs, &action)?;
        let diff = (logp - logp_eval)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        let entropy = entropy.to_scalar::<f32>()?;
        assert!(entropy > 0.0 && entropy <= (5f32).ln() + 1e-5);
        Ok(())
    }

    #[test]
    fn test_gaussian_policy() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let space = ActionSpace::Box {
            low: vec![-1.0; 3],
            high: vec![1.0; 3],
        };
        let policy = ActorCritic::build(config().action_space(space), &Device::Cpu)?;
        let xs = input(2)?;

        // log-density at the mean with unit std
        let (_, action, logp) = policy.act(&xs, true, &mut rng)?;
        assert_eq!(action.dims(), [2, 3]);
        let expected = -1.5 * (2.0 * std::f32::consts::PI).ln();
        for lp in logp.flatten_all()?.to_vec1::<f32>()? {
            assert!((lp - expected).abs() < 1e-4);
        }

        let (_, action, _) = policy.act(&xs, false, &mut rng)?;
        let (value, _, entropy) = policy.evaluate_actions(&xs, &action)?;
        assert_eq!(value.dims(), [2, 1]);
        let expected = 1.5 * (1.0 + (2.0 * std::f32::consts::PI).ln());
        assert!((entropy.to_scalar::<f32>()? - expected).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_missing_input_is_an_error() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let policy = ActorCritic::build(config(), &Device::Cpu)?;
        let mut xs = input(1)?;
        xs.latent = None;
        assert!(policy.act(&xs, false, &mut rng).is_err());

        let config = config().pass(false, false, false, false);
        assert!(ActorCritic::build(config, &Device::Cpu).is_err());
        Ok(())
    }
}
