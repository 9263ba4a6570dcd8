//! Configuration of [`MetaLearner`](super::MetaLearner).
use crate::{policy::PolicyConfig, ppo::PpoConfig, vae::VaeConfig, Device};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};
use varibad_core::{error::VaribadError, vec_env::VecEnvConfig};

/// Configuration of [`MetaLearner`](super::MetaLearner).
///
/// Dimensions of states, actions, tasks and beliefs in the nested configurations are
/// filled in from the environment when the meta-learner is built.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct MetaLearnerConfig {
    /// Random seed.
    pub seed: u64,

    /// The number of environment frames of the training run.
    pub num_frames: usize,

    /// The number of training workers.
    pub num_processes: usize,

    /// Length of a rollout window in steps.
    pub policy_num_steps: usize,

    /// The number of inner episodes per task.
    pub episodes_per_task: usize,

    /// Feeds latent samples instead of means and log-variances to the policy.
    pub sample_embeddings: bool,

    /// Applies ReLU to latents before feeding them to the policy.
    pub add_nonlinearity_to_latent: bool,

    /// Uses generalized advantage estimation.
    pub use_gae: bool,

    /// Discount factor.
    pub gamma: f64,

    /// GAE parameter.
    pub tau: f64,

    /// Bootstraps over episode ends caused by the time limit.
    pub use_proper_time_limits: bool,

    /// Trains the policy on normalised rewards.
    pub normalise_rewards: bool,

    /// Normalised rewards are clipped to `[-clip_reward, clip_reward]`.
    pub clip_reward: f64,

    /// The number of VAE updates before the first policy update.
    pub pretrain_len: usize,

    /// Frames collected before the first update.
    pub precollect_len: usize,

    /// Detaches the encoder hidden state every `k` steps when recomputing embeddings.
    pub tbptt_stepsize: Option<usize>,

    /// Interval of recording training statistics in updates.
    pub log_interval: usize,

    /// Interval of evaluation in updates.
    pub eval_interval: usize,

    /// Interval of calling the visualisation hook in updates.
    pub vis_interval: usize,

    /// Interval of saving models in updates.
    pub save_interval: usize,

    /// Also saves models tagged with the update index.
    pub save_intermediate_models: bool,

    /// The number of evaluation workers.
    pub num_eval_processes: usize,

    /// Fails training if recomputed latents differ from the online ones.
    pub strict_recompute_check: bool,

    /// Directory of checkpoints.
    pub model_dir: Option<String>,

    /// Device of the networks.
    pub device: Device,

    /// Policy.
    pub policy: PolicyConfig,

    /// Encoder, decoders and their training.
    pub vae: VaeConfig,

    /// Policy optimisation.
    pub ppo: PpoConfig,
}

impl Default for MetaLearnerConfig {
    fn default() -> Self {
        Self {
            seed: 73,
            num_frames: 4_000_000,
            num_processes: 16,
            policy_num_steps: 60,
            episodes_per_task: 4,
            sample_embeddings: false,
            add_nonlinearity_to_latent: false,
            use_gae: true,
            gamma: 0.95,
            tau: 0.95,
            use_proper_time_limits: false,
            normalise_rewards: true,
            clip_reward: 10.0,
            pretrain_len: 0,
            precollect_len: 5000,
            tbptt_stepsize: None,
            log_interval: 25,
            eval_interval: 25,
            vis_interval: 50,
            save_interval: 500,
            save_intermediate_models: false,
            num_eval_processes: 16,
            strict_recompute_check: false,
            model_dir: None,
            device: Device::Cpu,
            policy: PolicyConfig::default(),
            vae: VaeConfig::default(),
            ppo: PpoConfig::default(),
        }
    }
}

impl MetaLearnerConfig {
    /// Sets the random seed.
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Sets the number of environment frames.
    pub fn num_frames(mut self, v: usize) -> Self {
        self.num_frames = v;
        self
    }

    /// Sets the number of training workers.
    pub fn num_processes(mut self, v: usize) -> Self {
        self.num_processes = v;
        self
    }

    /// Sets the length of rollout windows.
    pub fn policy_num_steps(mut self, v: usize) -> Self {
        self.policy_num_steps = v;
        self
    }

    /// Sets the number of inner episodes per task.
    pub fn episodes_per_task(mut self, v: usize) -> Self {
        self.episodes_per_task = v;
        self
    }

    /// Sets the latent dimension of the encoder and the decoders.
    pub fn latent_dim(mut self, v: usize) -> Self {
        self.vae.encoder.latent_dim = v;
        self.vae.decoder.latent_dim = v;
        self
    }

    /// Selects the inputs of the policy.
    pub fn pass(mut self, state: bool, belief: bool, task: bool, latent: bool) -> Self {
        self.policy = self.policy.pass(state, belief, task, latent);
        self
    }

    /// Sets how latents are fed to the policy.
    pub fn latent_for_policy(mut self, sample_embeddings: bool, add_nonlinearity: bool) -> Self {
        self.sample_embeddings = sample_embeddings;
        self.add_nonlinearity_to_latent = add_nonlinearity;
        self
    }

    /// Sets the discount factor.
    pub fn gamma(mut self, v: f64) -> Self {
        self.gamma = v;
        self
    }

    /// Enables or disables GAE with parameter `tau`.
    pub fn gae(mut self, use_gae: bool, tau: f64) -> Self {
        self.use_gae = use_gae;
        self.tau = tau;
        self
    }

    /// Enables bootstrapping over time-limit episode ends.
    pub fn use_proper_time_limits(mut self, v: bool) -> Self {
        self.use_proper_time_limits = v;
        self
    }

    /// Enables reward normalisation for the policy.
    pub fn normalise_rewards(mut self, v: bool) -> Self {
        self.normalise_rewards = v;
        self
    }

    /// Sets the learning rate of the policy.
    pub fn lr_policy(mut self, v: f64) -> Self {
        self.ppo.opt_config = self.ppo.opt_config.learning_rate(v);
        self
    }

    /// Sets the learning rate of the encoder and the decoders.
    pub fn lr_vae(mut self, v: f64) -> Self {
        self.vae.opt_config = self.vae.opt_config.learning_rate(v);
        self
    }

    /// Sets VAE pretraining and the number of frames collected before updating.
    pub fn pretrain(mut self, pretrain_len: usize, precollect_len: usize) -> Self {
        self.pretrain_len = pretrain_len;
        self.precollect_len = precollect_len;
        self
    }

    /// Sets the truncation interval of backpropagation through time.
    pub fn tbptt_stepsize(mut self, v: Option<usize>) -> Self {
        self.tbptt_stepsize = v;
        self
    }

    /// Sets the intervals of logging, evaluation, visualisation and saving in updates.
    pub fn intervals(mut self, log: usize, eval: usize, vis: usize, save: usize) -> Self {
        self.log_interval = log;
        self.eval_interval = eval;
        self.vis_interval = vis;
        self.save_interval = save;
        self
    }

    /// Also saves models tagged with the update index.
    pub fn save_intermediate_models(mut self, v: bool) -> Self {
        self.save_intermediate_models = v;
        self
    }

    /// Sets the number of evaluation workers.
    pub fn num_eval_processes(mut self, v: usize) -> Self {
        self.num_eval_processes = v;
        self
    }

    /// Fails training on a recompute mismatch.
    pub fn strict_recompute_check(mut self, v: bool) -> Self {
        self.strict_recompute_check = v;
        self
    }

    /// Sets the directory of checkpoints.
    pub fn model_dir<T: Into<String>>(mut self, v: T) -> Self {
        self.model_dir = Some(v.into());
        self
    }

    /// Sets the device.
    pub fn device(mut self, v: Device) -> Self {
        self.device = v;
        self
    }

    /// Sets the configuration of the policy.
    pub fn policy(mut self, v: PolicyConfig) -> Self {
        self.policy = v;
        self
    }

    /// Sets the configuration of the VAE.
    pub fn vae(mut self, v: VaeConfig) -> Self {
        self.vae = v;
        self
    }

    /// Sets the configuration of PPO.
    pub fn ppo(mut self, v: PpoConfig) -> Self {
        self.ppo = v;
        self
    }

    /// The number of policy updates of the run.
    pub fn num_updates(&self) -> usize {
        match self.policy_num_steps * self.num_processes {
            0 => 0,
            n => self.num_frames / n,
        }
    }

    /// Configuration of the training environments.
    pub fn vec_env_config(&self) -> VecEnvConfig {
        VecEnvConfig::default()
            .num_processes(self.num_processes)
            .seed(self.seed)
            .episodes_per_task(self.episodes_per_task)
            .normalise_rew(self.normalise_rewards)
            .gamma(self.gamma)
            .clip_reward(self.clip_reward)
    }

    /// Checks combinations of settings that cannot train.
    pub fn check(&self) -> Result<()> {
        let err = |msg: &str| Err(VaribadError::ConfigError(msg.to_string()).into());
        if self.num_processes == 0 || self.num_eval_processes == 0 {
            return err("the number of workers must be positive");
        }
        if self.policy_num_steps == 0 {
            return err("policy_num_steps must be positive");
        }
        if self.episodes_per_task == 0 {
            return err("episodes_per_task must be positive");
        }
        if self.num_updates() == 0 {
            return err("num_frames is smaller than a single rollout window");
        }
        if self.log_interval == 0
            || self.eval_interval == 0
            || self.vis_interval == 0
            || self.save_interval == 0
        {
            return err("intervals must be positive");
        }
        let p = &self.policy;
        if !(p.pass_state || p.pass_belief || p.pass_task || p.pass_latent) {
            return err("the policy has no input");
        }
        if self.ppo.rlloss_through_encoder && !p.pass_latent {
            return err("rlloss_through_encoder requires the latent as policy input");
        }
        if self.sample_embeddings && self.vae.disable_stochasticity_in_latent {
            return err("sample_embeddings requires a stochastic latent");
        }
        if self.vae.encoder.latent_dim != self.vae.decoder.latent_dim {
            return err("latent dimensions of the encoder and the decoders differ");
        }
        if self.ppo.num_mini_batch == 0
            || self.ppo.num_mini_batch > self.num_processes * self.policy_num_steps
        {
            return err("num_mini_batch must be in [1, num_processes * policy_num_steps]");
        }
        Ok(())
    }

    /// Constructs [`MetaLearnerConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`MetaLearnerConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
