use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`RnnEncoder`](super::RnnEncoder).
pub struct EncoderConfig {
    /// Dimension of states.
    pub state_dim: usize,

    /// Dimension of actions, `1` for discrete actions.
    pub action_dim: usize,

    /// Embedding size of states.
    pub state_embed_dim: usize,

    /// Embedding size of actions.
    pub action_embed_dim: usize,

    /// Embedding size of rewards.
    pub reward_embed_dim: usize,

    /// If `true`, the previous state is embedded as well.
    pub use_prev_state: bool,

    /// Hidden units of the layers between embeddings and the GRU.
    pub layers_before_gru: Vec<usize>,

    /// Hidden size of the GRU.
    pub hidden_size: usize,

    /// Hidden units of the layers between the GRU and the latent heads.
    pub layers_after_gru: Vec<usize>,

    /// Dimension of the latent task embedding.
    pub latent_dim: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            state_dim: 0,
            action_dim: 1,
            state_embed_dim: 10,
            action_embed_dim: 5,
            reward_embed_dim: 5,
            use_prev_state: false,
            layers_before_gru: vec![],
            hidden_size: 64,
            layers_after_gru: vec![],
            latent_dim: 5,
        }
    }
}

impl EncoderConfig {
    /// Sets the dimension of states.
    pub fn state_dim(mut self, v: usize) -> Self {
        self.state_dim = v;
        self
    }

    /// Sets the dimension of actions.
    pub fn action_dim(mut self, v: usize) -> Self {
        self.action_dim = v;
        self
    }

    /// Sets the embedding sizes of states, actions and rewards.
    pub fn embed_dims(mut self, state: usize, action: usize, reward: usize) -> Self {
        self.state_embed_dim = state;
        self.action_embed_dim = action;
        self.reward_embed_dim = reward;
        self
    }

    /// Sets whether the previous state is embedded.
    pub fn use_prev_state(mut self, v: bool) -> Self {
        self.use_prev_state = v;
        self
    }

    /// Sets the layers before the GRU.
    pub fn layers_before_gru(mut self, v: Vec<usize>) -> Self {
        self.layers_before_gru = v;
        self
    }

    /// Sets the hidden size of the GRU.
    pub fn hidden_size(mut self, v: usize) -> Self {
        self.hidden_size = v;
        self
    }

    /// Sets the layers after the GRU.
    pub fn layers_after_gru(mut self, v: Vec<usize>) -> Self {
        self.layers_after_gru = v;
        self
    }

    /// Sets the latent dimension.
    pub fn latent_dim(mut self, v: usize) -> Self {
        self.latent_dim = v;
        self
    }

    /// Constructs [`EncoderConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`EncoderConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
