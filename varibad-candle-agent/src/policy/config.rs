use crate::Activation;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};
use varibad_core::ActionSpace;

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`ActorCritic`](super::ActorCritic).
pub struct PolicyConfig {
    /// Feeds states to the policy.
    pub pass_state: bool,

    /// Feeds ground-truth beliefs to the policy.
    pub pass_belief: bool,

    /// Feeds ground-truth tasks to the policy.
    pub pass_task: bool,

    /// Feeds latent embeddings to the policy.
    pub pass_latent: bool,

    /// Dimension of states.
    pub state_dim: usize,

    /// Dimension of beliefs.
    pub belief_dim: usize,

    /// Dimension of tasks.
    pub task_dim: usize,

    /// Dimension of the latent input, i.e., the latent dimension for sampled
    /// embeddings and twice that for concatenated mean and log-variance.
    pub latent_dim: usize,

    /// Embedding size of states, `0` feeds states as they are.
    pub state_embed_dim: usize,

    /// Embedding size of beliefs, `0` feeds beliefs as they are.
    pub belief_embed_dim: usize,

    /// Embedding size of tasks, `0` feeds tasks as they are.
    pub task_embed_dim: usize,

    /// Embedding size of latents, `0` feeds latents as they are.
    pub latent_embed_dim: usize,

    /// Hidden units of the actor and critic trunks.
    pub layers: Vec<usize>,

    /// Activation function of the trunks.
    pub activation: Activation,

    /// Action space.
    pub action_space: ActionSpace,

    /// Initial standard deviation of Gaussian policies.
    pub init_std: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            pass_state: true,
            pass_belief: false,
            pass_task: false,
            pass_latent: true,
            state_dim: 0,
            belief_dim: 0,
            task_dim: 0,
            latent_dim: 0,
            state_embed_dim: 10,
            belief_embed_dim: 10,
            task_embed_dim: 10,
            latent_embed_dim: 10,
            layers: vec![32],
            activation: Activation::Tanh,
            action_space: ActionSpace::Discrete(2),
            init_std: 1.0,
        }
    }
}

impl PolicyConfig {
    /// Selects the inputs of the policy.
    pub fn pass(mut self, state: bool, belief: bool, task: bool, latent: bool) -> Self {
        self.pass_state = state;
        self.pass_belief = belief;
        self.pass_task = task;
        self.pass_latent = latent;
        self
    }

    /// Sets the dimensions of states, beliefs, tasks and latent inputs.
    pub fn dims(mut self, state: usize, belief: usize, task: usize, latent: usize) -> Self {
        self.state_dim = state;
        self.belief_dim = belief;
        self.task_dim = task;
        self.latent_dim = latent;
        self
    }

    /// Sets the embedding sizes of states, beliefs, tasks and latents.
    pub fn embed_dims(mut self, state: usize, belief: usize, task: usize, latent: usize) -> Self {
        self.state_embed_dim = state;
        self.belief_embed_dim = belief;
        self.task_embed_dim = task;
        self.latent_embed_dim = latent;
        self
    }

    /// Sets the hidden units of the trunks.
    pub fn layers(mut self, v: Vec<usize>) -> Self {
        self.layers = v;
        self
    }

    /// Sets the activation function of the trunks.
    pub fn activation(mut self, v: Activation) -> Self {
        self.activation = v;
        self
    }

    /// Sets the action space.
    pub fn action_space(mut self, v: ActionSpace) -> Self {
        self.action_space = v;
        self
    }

    /// Sets the initial standard deviation of Gaussian policies.
    pub fn init_std(mut self, v: f64) -> Self {
        self.init_std = v;
        self
    }

    /// Constructs [`PolicyConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`PolicyConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
