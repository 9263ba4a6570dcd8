use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of the decoders.
pub struct DecoderConfig {
    /// Dimension of the latent fed to the decoders.
    pub latent_dim: usize,

    /// Dimension of states.
    pub state_dim: usize,

    /// Dimension of actions.
    pub action_dim: usize,

    /// Dimension of tasks.
    pub task_dim: usize,

    /// Embedding size of states.
    pub state_embed_dim: usize,

    /// Embedding size of actions.
    pub action_embed_dim: usize,

    /// Hidden units of the reward decoder.
    pub reward_layers: Vec<usize>,

    /// Hidden units of the state transition decoder.
    pub state_layers: Vec<usize>,

    /// Hidden units of the task decoder.
    pub task_layers: Vec<usize>,

    /// If `true`, the reward decoder also takes the previous state.
    pub reward_input_prev_state: bool,

    /// If `true`, the reward decoder also takes the action.
    pub reward_input_action: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            latent_dim: 5,
            state_dim: 0,
            action_dim: 1,
            task_dim: 0,
            state_embed_dim: 10,
            action_embed_dim: 10,
            reward_layers: vec![64, 32],
            state_layers: vec![64, 32],
            task_layers: vec![64, 32],
            reward_input_prev_state: false,
            reward_input_action: false,
        }
    }
}

impl DecoderConfig {
    /// Sets the latent dimension.
    pub fn latent_dim(mut self, v: usize) -> Self {
        self.latent_dim = v;
        self
    }

    /// Sets the dimensions of states, actions and tasks.
    pub fn dims(mut self, state_dim: usize, action_dim: usize, task_dim: usize) -> Self {
        self.state_dim = state_dim;
        self.action_dim = action_dim;
        self.task_dim = task_dim;
        self
    }

    /// Sets the embedding sizes of states and actions.
    pub fn embed_dims(mut self, state: usize, action: usize) -> Self {
        self.state_embed_dim = state;
        self.action_embed_dim = action;
        self
    }

    /// Sets the hidden units of the reward decoder.
    pub fn reward_layers(mut self, v: Vec<usize>) -> Self {
        self.reward_layers = v;
        self
    }

    /// Sets the hidden units of the state transition decoder.
    pub fn state_layers(mut self, v: Vec<usize>) -> Self {
        self.state_layers = v;
        self
    }

    /// Sets the hidden units of the task decoder.
    pub fn task_layers(mut self, v: Vec<usize>) -> Self {
        self.task_layers = v;
        self
    }

    /// Sets the optional inputs of the reward decoder.
    pub fn reward_inputs(mut self, prev_state: bool, action: bool) -> Self {
        self.reward_input_prev_state = prev_state;
        self.reward_input_action = action;
        self
    }

    /// Constructs [`DecoderConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`DecoderConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
