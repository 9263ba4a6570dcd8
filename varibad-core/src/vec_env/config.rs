use crate::error::VaribadError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of vectorized environments built with [`make_vec_envs`](super::make_vec_envs).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct VecEnvConfig {
    /// The number of environments.
    pub num_processes: usize,

    /// Base random seed; worker `i` is seeded with `seed + i`.
    pub seed: u64,

    /// The number of inner episodes per task.
    pub episodes_per_task: usize,

    /// If `true`, rewards are normalised by the running std of discounted returns.
    pub normalise_rew: bool,

    /// Discount factor of the returns used for normalisation.
    pub gamma: f64,

    /// Normalised rewards are clipped to `[-clip_reward, clip_reward]`.
    pub clip_reward: f64,
}

impl Default for VecEnvConfig {
    fn default() -> Self {
        Self {
            num_processes: 1,
            seed: 73,
            episodes_per_task: 1,
            normalise_rew: true,
            gamma: 0.99,
            clip_reward: 10.0,
        }
    }
}

impl VecEnvConfig {
    /// Sets the number of environments.
    pub fn num_processes(mut self, v: usize) -> Self {
        self.num_processes = v;
        self
    }

    /// Sets the random seed.
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Sets the number of inner episodes per task.
    pub fn episodes_per_task(mut self, v: usize) -> Self {
        self.episodes_per_task = v;
        self
    }

    /// Enables reward normalisation.
    pub fn normalise_rew(mut self, v: bool) -> Self {
        self.normalise_rew = v;
        self
    }

    /// Sets the discount factor used for reward normalisation.
    pub fn gamma(mut self, v: f64) -> Self {
        self.gamma = v;
        self
    }

    /// Sets the clipping range of normalised rewards.
    pub fn clip_reward(mut self, v: f64) -> Self {
        self.clip_reward = v;
        self
    }

    /// Checks the configuration.
    pub fn check(&self) -> Result<()> {
        if self.num_processes == 0 {
            return Err(VaribadError::ConfigError("num_processes must be positive".into()).into());
        }
        if self.episodes_per_task == 0 {
            return Err(
                VaribadError::ConfigError("episodes_per_task must be positive".into()).into(),
            );
        }
        Ok(())
    }

    /// Constructs [`VecEnvConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`VecEnvConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
