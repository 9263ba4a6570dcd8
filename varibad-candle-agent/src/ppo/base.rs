use super::PpoConfig;
use crate::{
    metalearner::{recompute_embeddings, RecomputeOptions},
    opt::Optimizer,
    policy::{ActorCritic, PolicyInput},
    storage::{MiniBatch, OnlineStorage},
    util::{clip_grad_norm, get_latent_for_policy, smooth_l1, update_linear_schedule},
    vae::VaribadVae,
};
use anyhow::Result;
use candle_core::{Tensor, Var};
use log::trace;
use rand::rngs::SmallRng;
use varibad_core::record::{Record, RecordValue};

/// Settings of a single call of [`Ppo::update`] owned by the training loop.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    /// Index of the current update.
    pub iter_idx: usize,

    /// Total number of updates of the run.
    pub num_updates: usize,

    /// Feeds latent samples instead of means and log-variances to the policy.
    pub sample_embeddings: bool,

    /// Applies ReLU to latents before feeding them to the policy.
    pub add_nonlinearity_to_latent: bool,

    /// Options of recomputing embeddings when the RL loss is backpropagated into the
    /// encoder.
    pub recompute: RecomputeOptions,
}

/// PPO with clipped surrogate objective.
pub struct Ppo {
    config: PpoConfig,
    policy: ActorCritic,
    policy_vars: Vec<Var>,
    opt: Optimizer,
}

impl Ppo {
    /// Constructs [`Ppo`] training the given policy.
    pub fn build(config: PpoConfig, policy: ActorCritic) -> Result<Self> {
        let policy_vars = policy.vars();
        let opt = config.opt_config.build(policy_vars.clone())?;
        Ok(Self {
            config,
            policy,
            policy_vars,
            opt,
        })
    }

    /// The policy.
    pub fn policy(&self) -> &ActorCritic {
        &self.policy
    }

    /// Mutable reference to the policy.
    pub fn policy_mut(&mut self) -> &mut ActorCritic {
        &mut self.policy
    }

    /// Configuration.
    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    /// Current learning rate of the policy optimizer.
    pub fn learning_rate(&self) -> f64 {
        self.opt.learning_rate()
    }

    fn policy_input(mb: &MiniBatch, latent: Tensor) -> PolicyInput {
        PolicyInput {
            state: Some(mb.state.clone()),
            belief: mb.belief.clone(),
            task: mb.task.clone(),
            latent: Some(latent),
        }
    }

    fn value_loss(&self, values: &Tensor, mb: &MiniBatch) -> Result<Tensor> {
        let clip = self.config.clip_param;
        let clipped = || -> Result<Tensor> {
            Ok((&mb.value_preds + (values - &mb.value_preds)?.clamp(-clip, clip)?)?)
        };

        let loss = match (self.config.use_huber_loss, self.config.use_clipped_value_loss) {
            (true, true) => {
                let losses = smooth_l1(values, &mb.returns)?;
                let losses_clipped = smooth_l1(&clipped()?, &mb.returns)?;
                (losses.maximum(&losses_clipped)?.mean_all()? * 0.5)?
            }
            (true, false) => smooth_l1(values, &mb.returns)?.mean_all()?,
            (false, true) => {
                let losses = (values - &mb.returns)?.sqr()?;
                let losses_clipped = (clipped()? - &mb.returns)?.sqr()?;
                (losses.maximum(&losses_clipped)?.mean_all()? * 0.5)?
            }
            (false, false) => ((&mb.returns - values)?.sqr()?.mean_all()? * 0.5)?,
        };
        Ok(loss)
    }

    /// Updates the policy on the rollout window in `storage`.
    ///
    /// Returns must have been computed. With `rlloss_through_encoder`, embeddings are
    /// recomputed with gradients before each mini-batch and the encoder is trained on
    /// the RL loss plus the VAE loss. Otherwise the VAE takes `num_vae_updates` steps
    /// after the PPO epochs.
    pub fn update(
        &mut self,
        storage: &mut OnlineStorage,
        vae: &mut VaribadVae,
        ctx: &UpdateContext,
        rng: &mut SmallRng,
    ) -> Result<Record> {
        if self.config.anneal_lr {
            update_linear_schedule(
                &mut self.opt,
                ctx.iter_idx,
                ctx.num_updates,
                self.config.opt_config.lr(),
            );
        }

        let advantages = storage.advantages()?;
        let mean = advantages.mean_all()?.to_scalar::<f32>()? as f64;
        let std = {
            let n = advantages.elem_count().max(2) as f64;
            let sq = (&advantages - mean)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            (sq / (n - 1.0)).sqrt()
        };
        let advantages = ((&advantages - mean)? / (std + 1e-5))?;

        let mut value_loss_epoch = 0f32;
        let mut action_loss_epoch = 0f32;
        let mut dist_entropy_epoch = 0f32;
        let mut loss_epoch = 0f32;
        let mut num_updates = 0;
        let mut vae_record = Record::empty();
        let encoder_vars = vae.encoder_vars();

        for e in 0..self.config.ppo_epoch {
            let batches =
                storage.feed_forward_generator(&advantages, self.config.num_mini_batch, rng)?;
            for mb in batches.iter() {
                trace!("PPO epoch {}, mini-batch {}", e, num_updates);
                let (sample, mean, logvar) = match self.config.rlloss_through_encoder {
                    true => {
                        let mut opts = ctx.recompute.clone();
                        opts.detach = false;
                        recompute_embeddings(storage, vae.encoder(), &opts, e + 1, rng)?;
                        storage.latents_at(&mb.indices)?
                    }
                    false => (
                        mb.latent_sample.clone(),
                        mb.latent_mean.clone(),
                        mb.latent_logvar.clone(),
                    ),
                };
                let latent = get_latent_for_policy(
                    ctx.sample_embeddings,
                    ctx.add_nonlinearity_to_latent,
                    &sample,
                    &mean,
                    &logvar,
                )?;
                let input = Self::policy_input(mb, latent);

                let (values, logp, dist_entropy) =
                    self.policy.evaluate_actions(&input, &mb.actions)?;
                let ratio = (logp - &mb.old_action_log_probs)?.exp()?;
                let surr1 = (&ratio * &mb.adv_targ)?;
                let clip = self.config.clip_param;
                let surr2 = (ratio.clamp(1.0 - clip, 1.0 + clip)? * &mb.adv_targ)?;
                let action_loss = surr1.minimum(&surr2)?.mean_all()?.neg()?;
                let value_loss = self.value_loss(&values, mb)?;

                let mut loss = (((&value_loss * self.config.value_loss_coef)? + &action_loss)?
                    - (&dist_entropy * self.config.entropy_coef)?)?;
                if self.config.rlloss_through_encoder {
                    let (vae_loss, record) = vae.compute_vae_loss(false, rng)?;
                    loss = (loss + (vae_loss * self.config.vae_loss_coeff)?)?;
                    vae_record = record;
                }

                let mut grads = loss.backward()?;
                if let Some(max_norm) = self.config.max_grad_norm {
                    clip_grad_norm(&self.policy_vars, &mut grads, max_norm)?;
                }
                self.opt.step(&grads)?;
                if self.config.rlloss_through_encoder {
                    if let Some(max_norm) = self.config.encoder_max_grad_norm {
                        clip_grad_norm(&encoder_vars, &mut grads, max_norm)?;
                    }
                    vae.step(&grads)?;
                }

                value_loss_epoch += value_loss.to_scalar::<f32>()?;
                action_loss_epoch += action_loss.to_scalar::<f32>()?;
                dist_entropy_epoch += dist_entropy.to_scalar::<f32>()?;
                loss_epoch += loss.to_scalar::<f32>()?;
                num_updates += 1;
            }
        }

        if !self.config.rlloss_through_encoder && !vae.config().disable_decoder {
            for _ in 0..self.config.num_vae_updates {
                let (_, record) = vae.compute_vae_loss(true, rng)?;
                vae_record = record;
            }
        }

        let n = num_updates.max(1) as f32;
        let mut record = Record::from_slice(&[
            ("policy_losses/value_loss", RecordValue::Scalar(value_loss_epoch / n)),
            ("policy_losses/action_loss", RecordValue::Scalar(action_loss_epoch / n)),
            ("policy_losses/dist_entropy", RecordValue::Scalar(dist_entropy_epoch / n)),
            ("policy_losses/sum", RecordValue::Scalar(loss_epoch / n)),
            ("policy/lr", RecordValue::Scalar(self.opt.learning_rate() as f32)),
        ]);
        record.merge_inplace(vae_record);
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        decoder::DecoderConfig,
        encoder::EncoderConfig,
        policy::PolicyConfig,
        storage::{OnlineStorageConfig, RolloutStep},
        util::{column_to_tensor, masks_from_flags},
        vae::VaeConfig,
    };
    use candle_core::{DType, Device};
    use rand::SeedableRng;
    use varibad_core::ActionSpace;

    const T: usize = 4;
    const N: usize = 2;

    fn build_vae() -> Result<VaribadVae> {
        let config = VaeConfig::default()
            .encoder(
                EncoderConfig::default()
                    .state_dim(2)
                    .action_dim(1)
                    .hidden_size(8)
                    .latent_dim(3),
            )
            .decoder(DecoderConfig::default().latent_dim(3).dims(2, 1, 0));
        VaribadVae::build(config, N, T, &Device::Cpu)
    }

    fn build_ppo(rlloss_through_encoder: bool) -> Result<Ppo> {
        let policy = ActorCritic::build(
            PolicyConfig::default()
                .dims(2, 0, 0, 6)
                .action_space(ActionSpace::Discrete(3)),
            &Device::Cpu,
        )?;
        let config = PpoConfig::default()
            .epochs(2, 2)
            .rlloss_through_encoder(rlloss_through_encoder);
        Ppo::build(config, policy)
    }

    /// Fills a window with transitions encoded online by the encoder of `vae`.
    fn fill(storage: &mut OnlineStorage, vae: &VaribadVae, rng: &mut SmallRng) -> Result<()> {
        let encoder = vae.encoder();
        let state = Tensor::zeros((N, 2), DType::F32, &Device::Cpu)?;
        storage.set_initial(state.clone(), None, None);
        let mut latent = encoder.prior(N, false, rng)?;
        storage.push_prior(&latent)?;
        for t in 0..T {
            let actions = column_to_tensor(&[(t % 3) as f32, ((t + 1) % 3) as f32], &Device::Cpu)?;
            let rewards = column_to_tensor(&[t as f32 * 0.1, -0.1], &Device::Cpu)?;
            let done = vec![false; N];
            let h = encoder.reset_hidden(&latent.hidden, &done)?;
            latent = encoder
                .forward_step(&h, &actions, &state, &rewards, &state, false, rng)?
                .detach();
            storage.insert(RolloutStep {
                state: state.clone(),
                next_state: state.clone(),
                belief: None,
                task: None,
                actions,
                action_log_probs: column_to_tensor(&[-1.1, -1.1], &Device::Cpu)?,
                rewards_raw: rewards.clone(),
                rewards_normalised: rewards,
                value_preds: column_to_tensor(&[0.0, 0.0], &Device::Cpu)?,
                masks: masks_from_flags(&done, &Device::Cpu)?,
                bad_masks: masks_from_flags(&done, &Device::Cpu)?,
                done,
                latent: latent.clone(),
            })?;
        }
        storage.compute_returns(
            &column_to_tensor(&[0.0, 0.0], &Device::Cpu)?,
            true,
            0.95,
            0.95,
            false,
        )
    }

    fn ctx() -> UpdateContext {
        UpdateContext {
            iter_idx: 0,
            num_updates: 10,
            sample_embeddings: false,
            add_nonlinearity_to_latent: false,
            recompute: RecomputeOptions {
                sample: false,
                detach_every: None,
                detach: true,
                strict: true,
            },
        }
    }

    fn storage() -> Result<OnlineStorage> {
        OnlineStorage::new(
            &OnlineStorageConfig {
                num_steps: T,
                num_processes: N,
                state_dim: 2,
                action_dim: 1,
                belief_dim: None,
                task_dim: None,
                hidden_size: 8,
                normalise_rewards: false,
            },
            &Device::Cpu,
        )
    }

    #[test]
    fn test_update_changes_policy() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut vae = build_vae()?;
        let mut ppo = build_ppo(false)?;
        let mut storage = storage()?;
        fill(&mut storage, &vae, &mut rng)?;

        let before: Vec<Vec<f32>> = ppo
            .policy()
            .vars()
            .iter()
            .map(|v| v.flatten_all().and_then(|t| t.to_vec1::<f32>()))
            .collect::<candle_core::Result<_>>()?;
        let record = ppo.update(&mut storage, &mut vae, &ctx(), &mut rng)?;
        let after: Vec<Vec<f32>> = ppo
            .policy()
            .vars()
            .iter()
            .map(|v| v.flatten_all().and_then(|t| t.to_vec1::<f32>()))
            .collect::<candle_core::Result<_>>()?;

        assert_ne!(before, after);
        assert!(record.get_scalar("policy_losses/value_loss")?.is_finite());
        assert!(record.get_scalar("policy_losses/dist_entropy")? > 0.0);
        assert!(record.get_scalar("policy/lr")? > 0.0);
        Ok(())
    }

    #[test]
    fn test_update_through_encoder() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut vae = build_vae()?;
        let mut ppo = build_ppo(true)?;
        let mut storage = storage()?;
        fill(&mut storage, &vae, &mut rng)?;

        let record = ppo.update(&mut storage, &mut vae, &ctx(), &mut rng)?;
        assert!(record.get_scalar("policy_losses/sum")?.is_finite());
        Ok(())
    }
}
