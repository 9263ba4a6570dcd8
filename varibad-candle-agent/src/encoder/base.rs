use super::EncoderConfig;
use crate::{
    mlp::{FeatureExtractor, FeatureExtractorConfig},
    model::SubModel1,
    util::sample_gaussian,
    Activation,
};
use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{
    linear,
    rnn::{gru, GRUConfig, GRUState, GRU, RNN},
    Linear, VarBuilder,
};
use rand::rngs::SmallRng;
use varibad_core::error::VaribadError;

/// Latent task embedding with the hidden state it was computed from.
///
/// Tensors are `[batch, dim]` for a single step and `[seq_len, batch, dim]` for
/// sequences.
#[derive(Debug, Clone)]
pub struct Latent {
    /// Sampled latent, equal to `mean` if sampling is disabled.
    pub sample: Tensor,

    /// Mean of the posterior.
    pub mean: Tensor,

    /// Log-variance of the posterior.
    pub logvar: Tensor,

    /// Hidden state of the GRU.
    pub hidden: Tensor,
}

impl Latent {
    /// Detaches all tensors from the computation graph.
    pub fn detach(&self) -> Self {
        Self {
            sample: self.sample.detach(),
            mean: self.mean.detach(),
            logvar: self.logvar.detach(),
            hidden: self.hidden.detach(),
        }
    }
}

/// Batch of zero-padded trajectories, each tensor `[seq_len, batch, dim]`.
#[derive(Debug, Clone)]
pub struct TrajectoryInput {
    /// States before the transitions.
    pub prev_states: Tensor,

    /// States after the transitions.
    pub next_states: Tensor,

    /// Actions.
    pub actions: Tensor,

    /// Raw rewards.
    pub rewards: Tensor,
}

impl TrajectoryInput {
    /// Length of the padded sequences.
    pub fn seq_len(&self) -> usize {
        self.actions.dims()[0]
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.actions.dims()[1]
    }
}

fn linear_layers(vb: VarBuilder, in_dim: usize, units: &[usize]) -> Result<Vec<Linear>> {
    let mut layers = Vec::with_capacity(units.len());
    let mut d = in_dim;
    for (i, &u) in units.iter().enumerate() {
        layers.push(linear(d, u, vb.pp(format!("ln{}", i)))?);
        d = u;
    }
    Ok(layers)
}

/// Recurrent encoder mapping a trajectory prefix to a Gaussian over latent tasks.
///
/// Each transition is embedded, passed through optional fully connected layers and
/// a GRU cell. The GRU output is mapped to the mean and log-variance of the latent.
/// The prior is the output for the zero hidden state, i.e., the belief before any
/// observation.
pub struct RnnEncoder {
    config: EncoderConfig,
    device: Device,
    state_encoder: FeatureExtractor,
    action_encoder: FeatureExtractor,
    reward_encoder: FeatureExtractor,
    prev_state_encoder: Option<FeatureExtractor>,
    fc_before_gru: Vec<Linear>,
    gru: GRU,
    fc_after_gru: Vec<Linear>,
    fc_mu: Linear,
    fc_logvar: Linear,
}

impl RnnEncoder {
    /// Constructs [`RnnEncoder`].
    pub fn build(vb: VarBuilder, config: EncoderConfig) -> Result<Self> {
        let device = vb.device().clone();
        let state_encoder = FeatureExtractor::build(
            vb.pp("state_encoder"),
            FeatureExtractorConfig::new(config.state_dim, config.state_embed_dim, Activation::ReLU),
        )?;
        let action_encoder = FeatureExtractor::build(
            vb.pp("action_encoder"),
            FeatureExtractorConfig::new(
                config.action_dim,
                config.action_embed_dim,
                Activation::ReLU,
            ),
        )?;
        let reward_encoder = FeatureExtractor::build(
            vb.pp("reward_encoder"),
            FeatureExtractorConfig::new(1, config.reward_embed_dim, Activation::ReLU),
        )?;
        let prev_state_encoder = match config.use_prev_state {
            false => None,
            true => Some(FeatureExtractor::build(
                vb.pp("prev_state_encoder"),
                FeatureExtractorConfig::new(
                    config.state_dim,
                    config.state_embed_dim,
                    Activation::ReLU,
                ),
            )?),
        };

        let embed_dim = state_encoder.out_dim()
            + action_encoder.out_dim()
            + reward_encoder.out_dim()
            + prev_state_encoder.as_ref().map_or(0, |e| e.out_dim());
        if embed_dim == 0 {
            return Err(VaribadError::ConfigError(
                "encoder needs at least one non-empty embedding".into(),
            )
            .into());
        }

        let fc_before_gru = linear_layers(vb.pp("fc_before_gru"), embed_dim, &config.layers_before_gru)?;
        let gru_in = config.layers_before_gru.last().copied().unwrap_or(embed_dim);
        let gru = gru(gru_in, config.hidden_size, GRUConfig::default(), vb.pp("gru"))?;
        let fc_after_gru =
            linear_layers(vb.pp("fc_after_gru"), config.hidden_size, &config.layers_after_gru)?;
        let head_in = config
            .layers_after_gru
            .last()
            .copied()
            .unwrap_or(config.hidden_size);
        let fc_mu = linear(head_in, config.latent_dim, vb.pp("fc_mu"))?;
        let fc_logvar = linear(head_in, config.latent_dim, vb.pp("fc_logvar"))?;

        Ok(Self {
            config,
            device,
            state_encoder,
            action_encoder,
            reward_encoder,
            prev_state_encoder,
            fc_before_gru,
            gru,
            fc_after_gru,
            fc_mu,
            fc_logvar,
        })
    }

    /// Configuration of the encoder.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Size of the hidden state.
    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Dimension of the latent.
    pub fn latent_dim(&self) -> usize {
        self.config.latent_dim
    }

    /// Prior hidden state of `batch_size` workers.
    pub fn prior_hidden(&self, batch_size: usize) -> Result<Tensor> {
        Ok(Tensor::zeros(
            (batch_size, self.config.hidden_size),
            DType::F32,
            &self.device,
        )?)
    }

    /// Latent for the prior hidden state.
    pub fn prior(&self, batch_size: usize, sample: bool, rng: &mut SmallRng) -> Result<Latent> {
        let hidden = self.prior_hidden(batch_size)?;
        self.heads(hidden, sample, rng)
    }

    /// Replaces the hidden state of workers with `done` set by the prior hidden state.
    ///
    /// Other rows are passed through unchanged.
    pub fn reset_hidden(&self, hidden: &Tensor, done: &[bool]) -> Result<Tensor> {
        let n = hidden.dims()[0];
        if done.len() != n {
            return Err(VaribadError::ConfigError(format!(
                "{} done flags for {} hidden states",
                done.len(),
                n
            ))
            .into());
        }
        if !done.iter().any(|&d| d) {
            return Ok(hidden.clone());
        }

        let mask: Vec<u8> = done.iter().map(|&d| d as u8).collect();
        let mask = Tensor::from_vec(mask, (n, 1), hidden.device())?.broadcast_as(hidden.shape())?;
        let prior = self.prior_hidden(n)?.to_device(hidden.device())?;
        Ok(mask.where_cond(&prior, hidden)?)
    }

    fn embed(
        &self,
        action: &Tensor,
        next_state: &Tensor,
        reward: &Tensor,
        prev_state: &Tensor,
    ) -> Result<Tensor> {
        let mut parts = vec![];
        if let Some(h) = self.action_encoder.forward(action)? {
            parts.push(h);
        }
        if let Some(h) = self.state_encoder.forward(next_state)? {
            parts.push(h);
        }
        if let Some(h) = self.reward_encoder.forward(reward)? {
            parts.push(h);
        }
        if let Some(enc) = &self.prev_state_encoder {
            if let Some(h) = enc.forward(prev_state)? {
                parts.push(h);
            }
        }

        let mut xs = Tensor::cat(&parts, D::Minus1)?;
        for layer in self.fc_before_gru.iter() {
            xs = layer.forward(&xs)?.relu()?;
        }
        Ok(xs)
    }

    fn heads(&self, hidden: Tensor, sample: bool, rng: &mut SmallRng) -> Result<Latent> {
        let mut xs = hidden.clone();
        for layer in self.fc_after_gru.iter() {
            xs = layer.forward(&xs)?.relu()?;
        }
        let mean = self.fc_mu.forward(&xs)?;
        let logvar = self.fc_logvar.forward(&xs)?;
        let sample = match sample {
            true => sample_gaussian(&mean, &logvar, rng)?,
            false => mean.clone(),
        };

        Ok(Latent {
            sample,
            mean,
            logvar,
            hidden,
        })
    }

    /// Encodes one transition per worker, each tensor `[batch, dim]`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_step(
        &self,
        hidden: &Tensor,
        action: &Tensor,
        next_state: &Tensor,
        reward: &Tensor,
        prev_state: &Tensor,
        sample: bool,
        rng: &mut SmallRng,
    ) -> Result<Latent> {
        let xs = self.embed(action, next_state, reward, prev_state)?;
        let state = self.gru.step(&xs, &GRUState { h: hidden.clone() })?;
        self.heads(state.h, sample, rng)
    }

    /// Encodes zero-padded trajectories.
    ///
    /// Starts from `hidden`, or from the prior hidden state if `hidden` is `None` or
    /// `return_prior` is set. With `return_prior`, the prior output is prepended, so the
    /// output sequence is one longer than the input.
    ///
    /// If `unpadded_lens` is given, only the output at the last valid timestep of each
    /// trajectory is returned as `[batch, dim]` tensors; padded timesteps are never
    /// selected. A trajectory of length zero selects the prior.
    ///
    /// With `detach_every = Some(k)`, the hidden state is detached every `k` steps.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_sequence(
        &self,
        input: &TrajectoryInput,
        hidden: Option<&Tensor>,
        return_prior: bool,
        sample: bool,
        unpadded_lens: Option<&[usize]>,
        detach_every: Option<usize>,
        rng: &mut SmallRng,
    ) -> Result<Latent> {
        let seq_len = input.seq_len();
        let batch_size = input.batch_size();

        let mut samples = Vec::with_capacity(seq_len + 1);
        let mut means = Vec::with_capacity(seq_len + 1);
        let mut logvars = Vec::with_capacity(seq_len + 1);
        let mut hiddens = Vec::with_capacity(seq_len + 1);
        let mut push = |out: Latent| {
            samples.push(out.sample);
            means.push(out.mean);
            logvars.push(out.logvar);
            hiddens.push(out.hidden);
        };

        let mut h = match (return_prior, hidden) {
            (false, Some(h)) => h.clone(),
            _ => self.prior_hidden(batch_size)?,
        };
        if return_prior {
            push(self.prior(batch_size, sample, rng)?);
        }

        for t in 0..seq_len {
            if let Some(k) = detach_every {
                if k > 0 && t % k == 0 && t != 0 {
                    h = h.detach();
                }
            }
            let at = |x: &Tensor| -> Result<Tensor> { Ok(x.narrow(0, t, 1)?.squeeze(0)?) };
            let out = self.forward_step(
                &h,
                &at(&input.actions)?,
                &at(&input.next_states)?,
                &at(&input.rewards)?,
                &at(&input.prev_states)?,
                sample,
                rng,
            )?;
            h = out.hidden.clone();
            push(out);
        }

        let seq = Latent {
            sample: Tensor::stack(&samples, 0)?,
            mean: Tensor::stack(&means, 0)?,
            logvar: Tensor::stack(&logvars, 0)?,
            hidden: Tensor::stack(&hiddens, 0)?,
        };

        match unpadded_lens {
            None => Ok(seq),
            Some(lens) => {
                let offset = return_prior as usize;
                let mut indices = Vec::with_capacity(batch_size);
                for (i, &len) in lens.iter().enumerate() {
                    if len + offset == 0 || len > seq_len {
                        return Err(VaribadError::ConfigError(format!(
                            "invalid length {} of trajectory {} padded to {}",
                            len, i, seq_len
                        ))
                        .into());
                    }
                    indices.push(((len + offset - 1) * batch_size + i) as u32);
                }
                let indices = Tensor::from_vec(indices, batch_size, &self.device)?;
                let select = |t: &Tensor| -> Result<Tensor> {
                    let dim = t.dims()[2];
                    Ok(t.reshape(((seq_len + offset) * batch_size, dim))?
                        .index_select(&indices, 0)?)
                };
                Ok(Latent {
                    sample: select(&seq.sample)?,
                    mean: select(&seq.mean)?,
                    logvar: select(&seq.logvar)?,
                    hidden: select(&seq.hidden)?,
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_nn::VarMap;
    use rand::SeedableRng;

    fn encoder(varmap: &VarMap) -> Result<RnnEncoder> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let config = EncoderConfig::default()
            .state_dim(2)
            .action_dim(1)
            .hidden_size(8)
            .latent_dim(3);
        RnnEncoder::build(vb, config)
    }

    fn padded_input(lens: &[usize], max_len: usize) -> Result<TrajectoryInput> {
        let n = lens.len();
        let mut states = vec![];
        let mut actions = vec![];
        let mut rewards = vec![];
        for t in 0..max_len {
            for (i, &len) in lens.iter().enumerate() {
                // padding is filled with large values to catch wrong selections
                let valid = t < len;
                let v = if valid { (t + i) as f32 * 0.1 } else { 99.0 };
                states.extend([v, -v]);
                actions.push(if valid { (t % 4) as f32 } else { 99.0 });
                rewards.push(if valid { -0.1f32 } else { 99.0 });
            }
        }
        let dev = Device::Cpu;
        let next_states = Tensor::from_vec(states, (max_len, n, 2), &dev)?;
        Ok(TrajectoryInput {
            prev_states: next_states.zeros_like()?,
            next_states,
            actions: Tensor::from_vec(actions, (max_len, n, 1), &dev)?,
            rewards: Tensor::from_vec(rewards, (max_len, n, 1), &dev)?,
        })
    }

    #[test]
    fn test_reset_hidden_rows() -> Result<()> {
        let varmap = VarMap::new();
        let enc = encoder(&varmap)?;
        let h = (Tensor::arange(0f32, 32f32, &Device::Cpu)?.reshape((4, 8))? + 0.5)?;
        let out = enc.reset_hidden(&h, &[false, true, false, true])?;

        let h = h.to_vec2::<f32>()?;
        let out = out.to_vec2::<f32>()?;
        assert_eq!(out[0], h[0]);
        assert_eq!(out[2], h[2]);
        assert_eq!(out[1], vec![0f32; 8]);
        assert_eq!(out[3], vec![0f32; 8]);
        Ok(())
    }

    #[test]
    fn test_unpadded_lens_select_last_valid_step() -> Result<()> {
        let varmap = VarMap::new();
        let enc = encoder(&varmap)?;
        let mut rng = SmallRng::seed_from_u64(42);
        let lens = [3, 5, 2];
        let input = padded_input(&lens, 5)?;
        for x in [&input.next_states, &input.actions, &input.rewards].iter() {
            assert_eq!(x.dtype(), DType::F32);
        }

        let full = enc.forward_sequence(&input, None, false, false, None, None, &mut rng)?;
        assert_eq!(full.mean.dims(), [5, 3, 3]);
        let selected =
            enc.forward_sequence(&input, None, false, false, Some(&lens), None, &mut rng)?;
        assert_eq!(selected.mean.dims(), [3, 3]);

        let full_mean = full.mean.to_vec3::<f32>()?;
        let selected_mean = selected.mean.to_vec2::<f32>()?;
        for (i, &t) in [2usize, 4, 1].iter().enumerate() {
            assert_eq!(selected_mean[i], full_mean[t][i]);
        }

        // the prior shifts the outputs by one
        let with_prior =
            enc.forward_sequence(&input, None, true, false, Some(&lens), None, &mut rng)?;
        assert_eq!(with_prior.mean.to_vec2::<f32>()?, selected_mean);
        assert_eq!(
            with_prior.hidden.to_vec2::<f32>()?,
            selected.hidden.to_vec2::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_zero_length_selects_prior() -> Result<()> {
        let varmap = VarMap::new();
        let enc = encoder(&varmap)?;
        let mut rng = SmallRng::seed_from_u64(0);
        let input = padded_input(&[0, 2], 2)?;
        let out = enc.forward_sequence(&input, None, true, false, Some(&[0, 2]), None, &mut rng)?;
        let prior = enc.prior(2, false, &mut rng)?;
        assert_eq!(
            out.mean.to_vec2::<f32>()?[0],
            prior.mean.to_vec2::<f32>()?[0]
        );
        assert_eq!(out.hidden.to_vec2::<f32>()?[0], vec![0f32; 8]);

        // without the prior a zero length cannot be selected
        assert!(enc
            .forward_sequence(&input, None, false, false, Some(&[0, 2]), None, &mut rng)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_sequence_matches_steps() -> Result<()> {
        let varmap = VarMap::new();
        let enc = encoder(&varmap)?;
        let mut rng = SmallRng::seed_from_u64(1);
        let input = padded_input(&[4, 4], 4)?;
        let seq = enc.forward_sequence(&input, None, true, false, None, Some(2), &mut rng)?;
        assert_eq!(seq.mean.dims(), [5, 2, 3]);

        let mut h = enc.prior_hidden(2)?;
        for t in 0..4 {
            let at = |x: &Tensor| x.narrow(0, t, 1).unwrap().squeeze(0).unwrap();
            let out = enc.forward_step(
                &h,
                &at(&input.actions),
                &at(&input.next_states),
                &at(&input.rewards),
                &at(&input.prev_states),
                false,
                &mut rng,
            )?;
            let expected = seq.mean.narrow(0, t + 1, 1)?.squeeze(0)?;
            let diff = (out.mean.clone() - expected)?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-6);
            h = out.hidden;
        }
        Ok(())
    }
}
