//! Environment.
use super::{ActionSpace, EnvStep};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Action of an environment.
///
/// Discrete actions are a single float holding the action index.
pub type Act = Vec<f32>;

/// Kind of environment, which changes the bookkeeping at inner-episode boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum EnvType {
    /// Regular environments.
    Gym,

    /// Maze-like environments, where the agent needs to see both the terminal state
    /// of an inner episode and the start state of the next one.
    Maze,
}

/// A single-episode MDP whose reward or dynamics depend on a task.
///
/// Methods with a default implementation correspond to optional capabilities:
/// an environment without a ground-truth belief or a task vector simply keeps the
/// defaults (`None` and `0`).
pub trait MetaEnv: Send {
    /// Resets the MDP and returns the initial observation. The task is unchanged.
    fn reset(&mut self) -> Result<Vec<f32>>;

    /// Performs an environment step.
    fn step(&mut self, act: &[f32]) -> Result<EnvStep>;

    /// Sets the given task, or samples a new one if `task` is `None`.
    ///
    /// Environments that can not take a task specification return
    /// [`VaribadError::UnsupportedTask`](crate::error::VaribadError::UnsupportedTask)
    /// for `Some(_)`.
    fn reset_task(&mut self, task: Option<&[f32]>) -> Result<Vec<f32>>;

    /// The current task.
    fn get_task(&self) -> Vec<f32>;

    /// The ground-truth belief over tasks.
    fn get_belief(&self) -> Option<Vec<f32>> {
        None
    }

    /// Dimension of the task vector.
    fn task_dim(&self) -> usize {
        0
    }

    /// Dimension of the belief vector.
    fn belief_dim(&self) -> usize {
        0
    }

    /// The number of states of a discrete environment.
    fn num_states(&self) -> Option<usize> {
        None
    }

    /// Step limit of an inner episode.
    fn max_episode_steps(&self) -> usize;

    /// The number of steps taken in the current inner episode.
    fn elapsed_steps(&self) -> usize;

    /// Shape of observations.
    fn observation_shape(&self) -> Vec<usize>;

    /// Action space.
    fn action_space(&self) -> ActionSpace;

    /// Kind of environment.
    fn env_type(&self) -> EnvType {
        EnvType::Gym
    }
}

impl<E: MetaEnv + ?Sized> MetaEnv for Box<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        (**self).reset()
    }

    fn step(&mut self, act: &[f32]) -> Result<EnvStep> {
        (**self).step(act)
    }

    fn reset_task(&mut self, task: Option<&[f32]>) -> Result<Vec<f32>> {
        (**self).reset_task(task)
    }

    fn get_task(&self) -> Vec<f32> {
        (**self).get_task()
    }

    fn get_belief(&self) -> Option<Vec<f32>> {
        (**self).get_belief()
    }

    fn task_dim(&self) -> usize {
        (**self).task_dim()
    }

    fn belief_dim(&self) -> usize {
        (**self).belief_dim()
    }

    fn num_states(&self) -> Option<usize> {
        (**self).num_states()
    }

    fn max_episode_steps(&self) -> usize {
        (**self).max_episode_steps()
    }

    fn elapsed_steps(&self) -> usize {
        (**self).elapsed_steps()
    }

    fn observation_shape(&self) -> Vec<usize> {
        (**self).observation_shape()
    }

    fn action_space(&self) -> ActionSpace {
        (**self).action_space()
    }

    fn env_type(&self) -> EnvType {
        (**self).env_type()
    }
}

/// Builds environments for the workers of a vectorized environment.
///
/// `rank` is the index of the worker; `seed` is the base random seed, so
/// implementations typically seed the environment with `seed + rank`.
pub trait EnvBuilder: Clone + Send + 'static {
    /// Environment built by this builder.
    type Env: MetaEnv + 'static;

    /// Builds an environment.
    fn build(&self, seed: u64, rank: usize) -> Result<Self::Env>;
}
