use crate::{decoder::DecoderConfig, encoder::EncoderConfig, opt::OptimizerConfig};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`VaribadVae`](super::VaribadVae).
pub struct VaeConfig {
    /// Configuration of the encoder.
    pub encoder: EncoderConfig,

    /// Configuration of the decoders.
    pub decoder: DecoderConfig,

    /// Optimizer of the encoder and the decoders.
    pub opt_config: OptimizerConfig,

    /// Reconstructs rewards.
    pub decode_reward: bool,

    /// Reconstructs next states.
    pub decode_state: bool,

    /// Reconstructs tasks.
    pub decode_task: bool,

    /// Coefficient of the reward reconstruction loss.
    pub rew_loss_coeff: f64,

    /// Coefficient of the state reconstruction loss.
    pub state_loss_coeff: f64,

    /// Coefficient of the task reconstruction loss.
    pub task_loss_coeff: f64,

    /// Weight of the KL term.
    pub kl_weight: f64,

    /// If `true`, every posterior is regularised towards `N(0, I)` instead of the
    /// previous posterior.
    pub kl_to_gauss_prior: bool,

    /// The number of trajectories in a batch for the VAE loss.
    pub vae_batch_num_trajs: usize,

    /// Maximum number of completed trajectories kept for training.
    pub vae_buffer_size: usize,

    /// Uses latent means instead of samples everywhere.
    pub disable_stochasticity_in_latent: bool,

    /// Disables training of the encoder and decoders.
    pub disable_decoder: bool,
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            decoder: DecoderConfig::default(),
            opt_config: OptimizerConfig::default().learning_rate(1e-3),
            decode_reward: true,
            decode_state: false,
            decode_task: false,
            rew_loss_coeff: 1.0,
            state_loss_coeff: 1.0,
            task_loss_coeff: 1.0,
            kl_weight: 0.1,
            kl_to_gauss_prior: false,
            vae_batch_num_trajs: 25,
            vae_buffer_size: 100_000,
            disable_stochasticity_in_latent: false,
            disable_decoder: false,
        }
    }
}

impl VaeConfig {
    /// Sets the configuration of the encoder.
    pub fn encoder(mut self, v: EncoderConfig) -> Self {
        self.encoder = v;
        self
    }

    /// Sets the configuration of the decoders.
    pub fn decoder(mut self, v: DecoderConfig) -> Self {
        self.decoder = v;
        self
    }

    /// Sets the optimizer configuration.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Enables or disables the reward, state and task decoders.
    pub fn decode(mut self, reward: bool, state: bool, task: bool) -> Self {
        self.decode_reward = reward;
        self.decode_state = state;
        self.decode_task = task;
        self
    }

    /// Sets the weight of the KL term.
    pub fn kl_weight(mut self, v: f64) -> Self {
        self.kl_weight = v;
        self
    }

    /// Sets the number of trajectories in a batch.
    pub fn vae_batch_num_trajs(mut self, v: usize) -> Self {
        self.vae_batch_num_trajs = v;
        self
    }

    /// Sets the maximum number of stored trajectories.
    pub fn vae_buffer_size(mut self, v: usize) -> Self {
        self.vae_buffer_size = v;
        self
    }

    /// Disables sampling of latents.
    pub fn disable_stochasticity_in_latent(mut self, v: bool) -> Self {
        self.disable_stochasticity_in_latent = v;
        self
    }

    /// Disables training of the encoder and decoders.
    pub fn disable_decoder(mut self, v: bool) -> Self {
        self.disable_decoder = v;
        self
    }

    /// Constructs [`VaeConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`VaeConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
