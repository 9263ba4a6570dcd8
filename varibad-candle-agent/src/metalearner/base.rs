use super::{eval::evaluate, recompute_embeddings, EvalResult, MetaLearnerConfig, RecomputeOptions};
use crate::{
    encoder::Latent,
    policy::{ActorCritic, PolicyConfig, PolicyInput},
    ppo::{Ppo, UpdateContext},
    storage::{OnlineStorage, OnlineStorageConfig, RolloutStep},
    util::{column_to_tensor, get_latent_for_policy, masks_from_flags, mean_scalar, rows_to_tensor},
    vae::VaribadVae,
};
use anyhow::Result;
use candle_core::{Device, Tensor};
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use std::{convert::TryFrom, fs, path::Path, time::Instant};
use varibad_core::{
    error::VaribadError,
    record::{Record, RecordValue, Recorder},
    util::seed,
    vec_env::{make_vec_envs, EnvSpec, RunningMeanStd, VecEnv, VecNormalize},
    EnvBuilder,
};

/// Called every `vis_interval` updates with the current models.
///
/// Errors are logged and never stop training.
pub trait VisualiseHook {
    /// Visualises the behaviour of the policy and the beliefs of the encoder.
    fn visualise(&mut self, iter_idx: usize, policy: &ActorCritic, vae: &VaribadVae) -> Result<()>;
}

/// Ground-truth beliefs and tasks of the workers, when fed to the policy.
pub(super) fn env_context<V: VecEnv>(
    envs: &V,
    policy: &PolicyConfig,
    device: &Device,
) -> Result<(Option<Tensor>, Option<Tensor>)> {
    let spec = envs.spec();
    let belief = match policy.pass_belief {
        false => None,
        true => {
            let beliefs = envs.get_belief()?.ok_or_else(|| {
                VaribadError::ConfigError("the environments do not provide beliefs".into())
            })?;
            Some(rows_to_tensor(&beliefs, spec.belief_dim, device)?)
        }
    };
    let task = match policy.pass_task {
        false => None,
        true => Some(rows_to_tensor(&envs.get_task()?, spec.task_dim, device)?),
    };
    Ok((belief, task))
}

/// Input of the policy with the latent prepared as configured.
pub(super) fn policy_input(
    config: &MetaLearnerConfig,
    state: &Tensor,
    belief: &Option<Tensor>,
    task: &Option<Tensor>,
    latent: &Latent,
) -> Result<PolicyInput> {
    let latent = get_latent_for_policy(
        config.sample_embeddings,
        config.add_nonlinearity_to_latent,
        &latent.sample,
        &latent.mean,
        &latent.logvar,
    )?;
    Ok(PolicyInput {
        state: Some(state.clone()),
        belief: belief.clone(),
        task: task.clone(),
        latent: Some(latent),
    })
}

/// Resets the workers in `done` and writes their initial observations into `obs`.
pub(super) fn reset_done<V: VecEnv>(envs: &mut V, obs: &mut [Vec<f32>], done: &[usize]) -> Result<()> {
    if done.is_empty() {
        return Ok(());
    }
    if done.len() == envs.num_envs() {
        for (o, new) in obs.iter_mut().zip(envs.reset(None, None)?) {
            *o = new;
        }
    } else {
        for &i in done {
            obs[i] = envs.reset(Some(i), None)?.pop().ok_or_else(|| {
                VaribadError::ConfigError(format!("no observation after resetting worker {}", i))
            })?;
        }
    }
    Ok(())
}

/// Actions, their log-probabilities and values of the last step of a rollout window.
struct RunStats {
    action: Tensor,
    action_log_probs: Tensor,
    value: Tensor,
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Trains a policy together with a VAE inferring the task from experience.
///
/// Each iteration of [`MetaLearner::train`] does the following:
///
/// 1. Encode the running trajectory of every worker to get the latent before the
///    window.
/// 2. For `policy_num_steps` steps, act on the current state and latent, step the
///    environments, update the latents with the new transitions, append them to the VAE
///    storage, and reset workers whose BAMDP episode ended.
/// 3. Once `precollect_len` frames have been collected, either pretrain the VAE (once,
///    if `pretrain_len > 0`) or update the policy and the VAE, then log.
/// 4. Clear the window.
///
/// ```mermaid
/// graph LR
///     A[ActorCritic]-->|actions|B[VecEnv]
///     B-->|transitions|C[RnnEncoder]
///     C-->|latents|A
///     B-->|transitions|D[VaeStorage]
///     B-->|rollout|E[OnlineStorage]
///     E-->|mini-batches|F[Ppo]
///     D-->|trajectories|G[VaribadVae]
/// ```
pub struct MetaLearner<B: EnvBuilder> {
    config: MetaLearnerConfig,
    env_builder: B,
    envs: VecNormalize<Box<dyn VecEnv>>,
    spec: EnvSpec,
    device: Device,
    vae: VaribadVae,
    ppo: Ppo,
    storage: OnlineStorage,
    rng: SmallRng,
    num_updates: usize,
    iter_idx: usize,
    frames: usize,
    start: Instant,
    vis_hook: Option<Box<dyn VisualiseHook>>,
}

impl<B: EnvBuilder> MetaLearner<B> {
    /// Builds the environments and the models.
    ///
    /// Dimensions in the configuration are taken from the environments.
    pub fn build(config: MetaLearnerConfig, env_builder: B) -> Result<Self> {
        config.check()?;
        let rng = seed(config.seed, config.num_processes);
        let device = Device::try_from(config.device)?;

        let envs = make_vec_envs(env_builder.clone(), &config.vec_env_config(), None)?;
        let spec = envs.spec().clone();
        let action_dim = spec.action_space.action_dim();
        info!(
            "Environment: state dim {}, action dim {}, task dim {}, belief dim {}, horizon {}",
            spec.state_dim, action_dim, spec.task_dim, spec.belief_dim, spec.horizon
        );

        let mut config = config;
        config.vae.encoder = config
            .vae
            .encoder
            .clone()
            .state_dim(spec.state_dim)
            .action_dim(action_dim);
        config.vae.decoder = config
            .vae
            .decoder
            .clone()
            .dims(spec.state_dim, action_dim, spec.task_dim);
        let latent_dim = config.vae.encoder.latent_dim;
        let latent_input_dim = match config.sample_embeddings {
            true => latent_dim,
            false => 2 * latent_dim,
        };
        config.policy = config
            .policy
            .clone()
            .dims(spec.state_dim, spec.belief_dim, spec.task_dim, latent_input_dim)
            .action_space(spec.action_space.clone());

        let vae = VaribadVae::build(
            config.vae.clone(),
            config.num_processes,
            spec.max_trajectory_len(),
            &device,
        )?;
        let policy = ActorCritic::build(config.policy.clone(), &device)?;
        let ppo = Ppo::build(config.ppo.clone(), policy)?;
        let storage = OnlineStorage::new(
            &OnlineStorageConfig {
                num_steps: config.policy_num_steps,
                num_processes: config.num_processes,
                state_dim: spec.state_dim,
                action_dim,
                belief_dim: config.policy.pass_belief.then(|| spec.belief_dim),
                task_dim: config.policy.pass_task.then(|| spec.task_dim),
                hidden_size: config.vae.encoder.hidden_size,
                normalise_rewards: config.normalise_rewards,
            },
            &device,
        )?;

        Ok(Self {
            num_updates: config.num_updates(),
            config,
            env_builder,
            envs,
            spec,
            device,
            vae,
            ppo,
            storage,
            rng,
            iter_idx: 0,
            frames: 0,
            start: Instant::now(),
            vis_hook: None,
        })
    }

    /// Sets the hook called every `vis_interval` updates.
    pub fn visualise_hook(mut self, hook: Box<dyn VisualiseHook>) -> Self {
        self.vis_hook = Some(hook);
        self
    }

    /// Configuration with the dimensions taken from the environments.
    pub fn config(&self) -> &MetaLearnerConfig {
        &self.config
    }

    /// The policy.
    pub fn policy(&self) -> &ActorCritic {
        self.ppo.policy()
    }

    /// The VAE.
    pub fn vae(&self) -> &VaribadVae {
        &self.vae
    }

    /// The number of environment frames collected so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// The number of policy updates of the run.
    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    fn state_tensor(&self, obs: &[Vec<f32>]) -> Result<Tensor> {
        rows_to_tensor(obs, self.spec.state_dim, &self.device)
    }

    fn sample_latent(&self) -> bool {
        !self.config.vae.disable_stochasticity_in_latent
    }

    /// Trains the policy and the VAE for `num_frames` frames.
    pub fn train(&mut self, recorder: &mut dyn Recorder) -> Result<()> {
        self.start = Instant::now();
        let mut obs = self.envs.reset(None, None)?;
        let (mut belief, mut task) = env_context(&self.envs, &self.config.policy, &self.device)?;
        self.storage
            .set_initial(self.state_tensor(&obs)?, belief.clone(), task.clone());

        // Evaluates the untrained policy
        self.log(None, None, recorder)?;

        let mut vae_is_pretrained = false;
        for iter_idx in 0..self.num_updates {
            self.iter_idx = iter_idx;
            let mut latent = self.encode_running_trajectory()?;
            self.storage.push_prior(&latent)?;

            let mut run_stats = None;
            for _ in 0..self.config.policy_num_steps {
                let (step, next_obs, stats) = self.rollout_step(&obs, &belief, &task, &latent)?;
                belief = step.belief.clone();
                task = step.task.clone();
                latent = step.latent.clone();
                self.storage.insert(step)?;
                obs = next_obs;
                run_stats = Some(stats);
                self.frames += self.config.num_processes;
            }

            if self.config.precollect_len <= self.frames {
                if self.config.pretrain_len > 0
                    && !vae_is_pretrained
                    && !self.config.vae.disable_decoder
                {
                    info!("Pretraining the VAE for {} updates", self.config.pretrain_len);
                    for _ in 0..self.config.pretrain_len {
                        self.vae.compute_vae_loss(true, &mut self.rng)?;
                    }
                    vae_is_pretrained = true;
                } else {
                    let train_stats = self.update()?;
                    self.log(run_stats.as_ref(), Some(train_stats), recorder)?;
                }
            }

            self.storage.after_update();
        }

        Ok(())
    }

    /// Takes one step of all workers.
    ///
    /// Returns the step to store, the observations after resetting finished workers,
    /// and the statistics of the actions.
    fn rollout_step(
        &mut self,
        obs: &[Vec<f32>],
        belief: &Option<Tensor>,
        task: &Option<Tensor>,
        latent: &Latent,
    ) -> Result<(RolloutStep, Vec<Vec<f32>>, RunStats)> {
        let state = self.state_tensor(obs)?;
        let input = policy_input(&self.config, &state, belief, task, latent)?;
        let (value, action, action_log_probs) =
            self.ppo.policy().act(&input, false, &mut self.rng)?;
        let acts = action.to_vec2::<f32>()?;
        let step = self.envs.step(acts.clone())?;

        let done = step.done();
        let bad_transitions: Vec<bool> = step.infos.iter().map(|i| i.bad_transition).collect();
        let next_state = self.state_tensor(&step.obs)?;
        let rewards_raw = column_to_tensor(&step.rewards_raw, &self.device)?;
        let rewards_normalised = column_to_tensor(&step.rewards_normalised, &self.device)?;

        let sample = self.sample_latent();
        let encoder = self.vae.encoder();
        let h = encoder.reset_hidden(&latent.hidden, &done)?;
        let next_latent = encoder
            .forward_step(&h, &action, &next_state, &rewards_raw, &state, sample, &mut self.rng)?
            .detach();

        let (store_trajectory, decode_task) = {
            let c = self.vae.config();
            (
                !(c.disable_decoder && c.disable_stochasticity_in_latent),
                c.decode_task,
            )
        };
        if store_trajectory {
            let tasks = match decode_task {
                true => Some(self.envs.get_task()?),
                false => None,
            };
            self.vae.storage_mut().insert(
                obs,
                &acts,
                &step.obs,
                &step.rewards_raw,
                &done,
                tasks.as_deref(),
            )?;
        }

        let mut next_obs = step.obs.clone();
        let done_indices = step.done_indices();
        if !done_indices.is_empty() {
            debug!("Resetting workers {:?}", done_indices);
        }
        reset_done(&mut self.envs, &mut next_obs, &done_indices)?;
        let (belief, task) = env_context(&self.envs, &self.config.policy, &self.device)?;

        let rollout_step = RolloutStep {
            state: self.state_tensor(&next_obs)?,
            next_state,
            belief,
            task,
            actions: action.clone(),
            action_log_probs: action_log_probs.clone(),
            rewards_raw,
            rewards_normalised,
            value_preds: value.clone(),
            masks: masks_from_flags(&done, &self.device)?,
            bad_masks: masks_from_flags(&bad_transitions, &self.device)?,
            done,
            latent: next_latent,
        };
        let stats = RunStats {
            action,
            action_log_probs,
            value,
        };
        Ok((rollout_step, next_obs, stats))
    }

    /// Encodes the running trajectories of the workers.
    ///
    /// Workers with an empty running trajectory get the prior.
    pub fn encode_running_trajectory(&mut self) -> Result<Latent> {
        let batch = self.vae.storage().get_running_batch(&self.device)?;
        let sample = self.sample_latent();
        let latent = self.vae.encoder().forward_sequence(
            &batch.input,
            None,
            true,
            sample,
            Some(&batch.lens),
            None,
            &mut self.rng,
        )?;
        Ok(latent.detach())
    }

    /// Updates the policy and the VAE on the current rollout window.
    ///
    /// Embeddings are recomputed first, then the value of the state after the window is
    /// bootstrapped from the recomputed last latent and returns are computed.
    pub fn update(&mut self) -> Result<Record> {
        let recompute = RecomputeOptions {
            sample: false,
            detach_every: self.config.tbptt_stepsize,
            detach: true,
            strict: self.config.strict_recompute_check,
        };
        recompute_embeddings(
            &mut self.storage,
            self.vae.encoder(),
            &recompute,
            0,
            &mut self.rng,
        )?;

        let next_value = {
            let s = &self.storage;
            let t = s.num_steps;
            let latent = get_latent_for_policy(
                self.config.sample_embeddings,
                self.config.add_nonlinearity_to_latent,
                &s.latent_samples[t],
                &s.latent_mean[t],
                &s.latent_logvar[t],
            )?;
            let input = PolicyInput {
                state: Some(s.prev_state[t].clone()),
                belief: s.beliefs.as_ref().map(|b| b[t].clone()),
                task: s.tasks.as_ref().map(|x| x[t].clone()),
                latent: Some(latent),
            };
            self.ppo.policy().get_value(&input)?.detach()
        };
        self.storage.compute_returns(
            &next_value,
            self.config.use_gae,
            self.config.gamma as f32,
            self.config.tau as f32,
            self.config.use_proper_time_limits,
        )?;

        let ctx = UpdateContext {
            iter_idx: self.iter_idx,
            num_updates: self.num_updates,
            sample_embeddings: self.config.sample_embeddings,
            add_nonlinearity_to_latent: self.config.add_nonlinearity_to_latent,
            recompute,
        };
        self.ppo
            .update(&mut self.storage, &mut self.vae, &ctx, &mut self.rng)
    }

    /// Evaluates the current policy on fresh workers.
    pub fn evaluate(&mut self) -> Result<EvalResult> {
        let ret_rms = match self.config.normalise_rewards {
            true => Some(self.envs.running_stats().clone()),
            false => None,
        };
        evaluate(
            &self.config,
            &self.env_builder,
            self.ppo.policy(),
            self.vae.encoder(),
            ret_rms,
            self.iter_idx,
            &self.device,
            &mut self.rng,
        )
    }

    fn latent_stats(&self) -> Result<(f32, f32)> {
        let s = &self.storage;
        if s.latent_mean.is_empty() {
            return Ok((0.0, 0.0));
        }
        let mean = mean_scalar(&Tensor::stack(&s.latent_mean, 0)?)?;
        let logvar = mean_scalar(&Tensor::stack(&s.latent_logvar, 0)?)?;
        Ok((mean, logvar))
    }

    /// Visualises, evaluates, saves and records statistics at their intervals.
    fn log(
        &mut self,
        run_stats: Option<&RunStats>,
        train_stats: Option<Record>,
        recorder: &mut dyn Recorder,
    ) -> Result<()> {
        let iter_idx = self.iter_idx;
        let mut record = Record::empty();

        if iter_idx % self.config.vis_interval == 0 {
            if let Some(hook) = self.vis_hook.as_mut() {
                if let Err(e) = hook.visualise(iter_idx, self.ppo.policy(), &self.vae) {
                    warn!("Visualisation at update {} failed: {}", iter_idx, e);
                }
            }
        }

        if iter_idx % self.config.eval_interval == 0 {
            let result = self.evaluate()?;
            let elapsed = self.start.elapsed().as_secs_f32().max(1e-6);
            let fps = (self.frames as f32 / elapsed) as usize;
            info!(
                "Updates {}, Meta-Episode Return {:.2}, Frames {}, FPS {}",
                iter_idx,
                result.meta_episode_return(),
                self.frames,
                fps
            );
            record.merge_inplace(result.to_record());
            record.insert("fps", RecordValue::Scalar(fps as f32));
        }

        if (iter_idx + 1) % self.config.save_interval == 0 {
            self.save("")?;
            if self.config.save_intermediate_models {
                self.save(&iter_idx.to_string())?;
            }
        }

        if iter_idx % self.config.log_interval == 0 {
            if let Some(train_stats) = train_stats {
                record.merge_inplace(train_stats);
                if let Some(stats) = run_stats {
                    record.insert("policy/action", RecordValue::Scalar(mean_scalar(&stats.action)?));
                    record.insert(
                        "policy/action_logprob",
                        RecordValue::Scalar(mean_scalar(&stats.action_log_probs)?),
                    );
                    record.insert("policy/value", RecordValue::Scalar(mean_scalar(&stats.value)?));
                }
                let (mean, logvar) = self.latent_stats()?;
                record.insert("encoder/latent_mean", RecordValue::Scalar(mean));
                record.insert("encoder/latent_logvar", RecordValue::Scalar(logvar));
                record.merge_inplace(self.ppo.policy().param_stats()?);
                record.merge_inplace(self.vae.param_stats()?);
            }
        }

        if !record.is_empty() {
            record.insert("iter_idx", RecordValue::Scalar(iter_idx as f32));
            record.insert("frames", RecordValue::Scalar(self.frames as f32));
            recorder.write(record);
        }
        Ok(())
    }

    fn models_dir(model_dir: impl AsRef<Path>) -> std::path::PathBuf {
        model_dir.as_ref().join("models")
    }

    /// Saves the policy, the VAE and the reward statistics under `{model_dir}/models/`.
    ///
    /// Does nothing if `model_dir` is not set.
    pub fn save(&self, label: &str) -> Result<()> {
        let model_dir = match &self.config.model_dir {
            Some(dir) => Self::models_dir(dir),
            None => return Ok(()),
        };
        fs::create_dir_all(&model_dir)?;

        let path = model_dir.join(format!("policy{}.safetensors", label));
        self.ppo.policy().save(&path)?;
        self.vae.save(&model_dir, label)?;
        if self.config.normalise_rewards {
            let path = model_dir.join(format!("env_rew_rms{}.json", label));
            self.envs.running_stats().save(&path)?;
            info!("Save reward statistics to {:?}", path);
        }
        Ok(())
    }

    /// Loads the models saved with the empty label under `{model_dir}/models/`.
    pub fn load(&mut self, model_dir: impl AsRef<Path>) -> Result<()> {
        let model_dir = Self::models_dir(model_dir);
        self.ppo
            .policy_mut()
            .load(model_dir.join("policy.safetensors"))?;
        self.vae.load(&model_dir, "")?;
        let path = model_dir.join("env_rew_rms.json");
        if self.config.normalise_rewards && path.exists() {
            self.envs.set_running_stats(RunningMeanStd::load(&path)?);
            info!("Load reward statistics from {:?}", path);
        }
        Ok(())
    }
}
