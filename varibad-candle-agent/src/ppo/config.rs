use crate::opt::OptimizerConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`Ppo`](super::Ppo).
pub struct PpoConfig {
    /// Optimizer of the policy.
    pub opt_config: OptimizerConfig,

    /// The number of epochs per update.
    pub ppo_epoch: usize,

    /// The number of mini-batches per epoch.
    pub num_mini_batch: usize,

    /// Clipping parameter of the surrogate objective.
    pub clip_param: f64,

    /// Coefficient of the value loss.
    pub value_loss_coef: f64,

    /// Coefficient of the entropy bonus.
    pub entropy_coef: f64,

    /// Maximum norm of policy gradients.
    pub max_grad_norm: Option<f64>,

    /// Maximum norm of encoder gradients when the RL loss is backpropagated into it.
    pub encoder_max_grad_norm: Option<f64>,

    /// Clips the value loss like the surrogate objective.
    pub use_clipped_value_loss: bool,

    /// Uses the Huber loss for the value function.
    pub use_huber_loss: bool,

    /// Decays the learning rate linearly to zero over training.
    pub anneal_lr: bool,

    /// Backpropagates the RL loss into the encoder.
    pub rlloss_through_encoder: bool,

    /// Coefficient of the VAE loss added to the RL loss with `rlloss_through_encoder`.
    pub vae_loss_coeff: f64,

    /// The number of VAE updates after the PPO epochs.
    pub num_vae_updates: usize,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            opt_config: OptimizerConfig::default(),
            ppo_epoch: 2,
            num_mini_batch: 4,
            clip_param: 0.1,
            value_loss_coef: 0.5,
            entropy_coef: 0.01,
            max_grad_norm: Some(0.5),
            encoder_max_grad_norm: None,
            use_clipped_value_loss: true,
            use_huber_loss: false,
            anneal_lr: false,
            rlloss_through_encoder: false,
            vae_loss_coeff: 1.0,
            num_vae_updates: 1,
        }
    }
}

impl PpoConfig {
    /// Sets the optimizer configuration.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Sets the number of epochs and mini-batches.
    pub fn epochs(mut self, ppo_epoch: usize, num_mini_batch: usize) -> Self {
        self.ppo_epoch = ppo_epoch;
        self.num_mini_batch = num_mini_batch;
        self
    }

    /// Sets the clipping parameter.
    pub fn clip_param(mut self, v: f64) -> Self {
        self.clip_param = v;
        self
    }

    /// Sets the coefficients of the value loss and the entropy bonus.
    pub fn coefs(mut self, value_loss_coef: f64, entropy_coef: f64) -> Self {
        self.value_loss_coef = value_loss_coef;
        self.entropy_coef = entropy_coef;
        self
    }

    /// Sets the maximum norm of policy gradients.
    pub fn max_grad_norm(mut self, v: Option<f64>) -> Self {
        self.max_grad_norm = v;
        self
    }

    /// Sets the value loss variant.
    pub fn value_loss(mut self, clipped: bool, huber: bool) -> Self {
        self.use_clipped_value_loss = clipped;
        self.use_huber_loss = huber;
        self
    }

    /// Enables linear learning rate annealing.
    pub fn anneal_lr(mut self, v: bool) -> Self {
        self.anneal_lr = v;
        self
    }

    /// Backpropagates the RL loss into the encoder.
    pub fn rlloss_through_encoder(mut self, v: bool) -> Self {
        self.rlloss_through_encoder = v;
        self
    }

    /// Sets the number of VAE updates per policy update.
    pub fn num_vae_updates(mut self, v: usize) -> Self {
        self.num_vae_updates = v;
        self
    }

    /// Constructs [`PpoConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`PpoConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
