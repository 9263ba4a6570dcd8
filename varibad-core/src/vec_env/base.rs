use super::RunningMeanStd;
use crate::{Act, ActionSpace, BamdpStep, BamdpWrapper, Boundary, Info, MetaEnv};
use anyhow::Result;

/// Dimensions and limits shared by all workers of a vectorized environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvSpec {
    /// Dimension of observations, including the done flag if appended.
    pub state_dim: usize,

    /// Dimension of task vectors.
    pub task_dim: usize,

    /// Dimension of beliefs.
    pub belief_dim: usize,

    /// The number of states of discrete environments.
    pub num_states: Option<usize>,

    /// Action space.
    pub action_space: ActionSpace,

    /// Step limit of inner episodes.
    pub max_episode_steps: usize,

    /// The number of inner episodes per task.
    pub episodes_per_task: usize,

    /// Horizon of the BAMDP.
    pub horizon: usize,
}

impl EnvSpec {
    /// Collects the specification of a wrapped environment.
    pub fn of<E: MetaEnv>(env: &BamdpWrapper<E>) -> Self {
        Self {
            state_dim: env.state_dim(),
            task_dim: env.inner().task_dim(),
            belief_dim: env.inner().belief_dim(),
            num_states: env.inner().num_states(),
            action_space: env.action_space(),
            max_episode_steps: env.inner().max_episode_steps(),
            episodes_per_task: env.episodes_per_task(),
            horizon: env.horizon(),
        }
    }

    /// Maximum length of a trajectory stored for one task.
    pub fn max_trajectory_len(&self) -> usize {
        self.max_episode_steps * self.episodes_per_task
    }
}

/// Batched step of a vectorized environment; entry `i` comes from worker `i`.
#[derive(Debug, Clone)]
pub struct VecStep {
    /// Observations.
    pub obs: Vec<Vec<f32>>,

    /// Rewards emitted by the environments.
    pub rewards_raw: Vec<f32>,

    /// Normalised rewards, equal to `rewards_raw` when normalisation is disabled.
    pub rewards_normalised: Vec<f32>,

    /// Information of the steps.
    pub infos: Vec<Info>,

    /// Episode boundaries.
    pub boundaries: Vec<Boundary>,
}

impl VecStep {
    /// Collects steps ordered by worker index.
    pub fn from_steps(steps: Vec<BamdpStep>) -> Self {
        let n = steps.len();
        let mut obs = Vec::with_capacity(n);
        let mut rewards_raw = Vec::with_capacity(n);
        let mut infos = Vec::with_capacity(n);
        let mut boundaries = Vec::with_capacity(n);
        for step in steps {
            obs.push(step.obs);
            rewards_raw.push(step.reward);
            infos.push(step.info);
            boundaries.push(step.boundary);
        }

        Self {
            obs,
            rewards_normalised: rewards_raw.clone(),
            rewards_raw,
            infos,
            boundaries,
        }
    }

    /// BAMDP done flags.
    pub fn done(&self) -> Vec<bool> {
        self.boundaries
            .iter()
            .map(|b| *b == Boundary::FinalBoundary)
            .collect()
    }

    /// Indices of workers whose BAMDP episode ended.
    pub fn done_indices(&self) -> Vec<usize> {
        self.boundaries
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == Boundary::FinalBoundary)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Runs several environments and exposes them as one batched environment.
///
/// Results of `*_wait` methods are ordered by worker index.
pub trait VecEnv {
    /// Specification of the environments.
    fn spec(&self) -> &EnvSpec;

    /// The number of environments.
    fn num_envs(&self) -> usize;

    /// Requests a reset with new tasks.
    ///
    /// If `index` is given, only that worker is reset. `tasks` has one entry for each
    /// environment being reset; if `None`, the environments sample tasks themselves.
    fn reset_async(&mut self, index: Option<usize>, tasks: Option<Vec<Vec<f32>>>) -> Result<()>;

    /// Waits for the observations of the environments requested in [`VecEnv::reset_async`].
    fn reset_wait(&mut self) -> Result<Vec<Vec<f32>>>;

    /// Requests a step of all environments.
    fn step_async(&mut self, acts: Vec<Act>) -> Result<()>;

    /// Waits for the steps requested in [`VecEnv::step_async`].
    fn step_wait(&mut self) -> Result<VecStep>;

    /// Resets the inner MDPs, keeping the tasks.
    fn reset_mdp(&mut self, index: Option<usize>) -> Result<Vec<Vec<f32>>>;

    /// Current tasks.
    fn get_task(&self) -> Result<Vec<Vec<f32>>>;

    /// Ground-truth beliefs, `None` if the environments do not maintain one.
    fn get_belief(&self) -> Result<Option<Vec<Vec<f32>>>>;

    /// Resets environments and waits for their observations.
    fn reset(&mut self, index: Option<usize>, tasks: Option<Vec<Vec<f32>>>) -> Result<Vec<Vec<f32>>> {
        self.reset_async(index, tasks)?;
        self.reset_wait()
    }

    /// Steps all environments and waits for the results.
    fn step(&mut self, acts: Vec<Act>) -> Result<VecStep> {
        self.step_async(acts)?;
        self.step_wait()
    }

    /// Statistics of reward normalisation, if any.
    fn ret_rms(&self) -> Option<&RunningMeanStd> {
        None
    }
}

impl<V: VecEnv + ?Sized> VecEnv for Box<V> {
    fn spec(&self) -> &EnvSpec {
        (**self).spec()
    }

    fn num_envs(&self) -> usize {
        (**self).num_envs()
    }

    fn reset_async(&mut self, index: Option<usize>, tasks: Option<Vec<Vec<f32>>>) -> Result<()> {
        (**self).reset_async(index, tasks)
    }

    fn reset_wait(&mut self) -> Result<Vec<Vec<f32>>> {
        (**self).reset_wait()
    }

    fn step_async(&mut self, acts: Vec<Act>) -> Result<()> {
        (**self).step_async(acts)
    }

    fn step_wait(&mut self) -> Result<VecStep> {
        (**self).step_wait()
    }

    fn reset_mdp(&mut self, index: Option<usize>) -> Result<Vec<Vec<f32>>> {
        (**self).reset_mdp(index)
    }

    fn get_task(&self) -> Result<Vec<Vec<f32>>> {
        (**self).get_task()
    }

    fn get_belief(&self) -> Result<Option<Vec<Vec<f32>>>> {
        (**self).get_belief()
    }

    fn ret_rms(&self) -> Option<&RunningMeanStd> {
        (**self).ret_rms()
    }
}

/// Worker indices addressed by an optional index.
pub(super) fn target_indices(index: Option<usize>, n: usize) -> Result<Vec<usize>> {
    match index {
        Some(i) if i < n => Ok(vec![i]),
        Some(i) => Err(crate::error::VaribadError::ConfigError(format!(
            "worker index {} out of range for {} workers",
            i, n
        ))
        .into()),
        None => Ok((0..n).collect()),
    }
}

/// Pairs each target worker with its task.
pub(super) fn tasks_for(
    targets: &[usize],
    tasks: Option<Vec<Vec<f32>>>,
) -> Result<Vec<Option<Vec<f32>>>> {
    match tasks {
        None => Ok(vec![None; targets.len()]),
        Some(tasks) if tasks.len() == targets.len() => Ok(tasks.into_iter().map(Some).collect()),
        Some(tasks) => Err(crate::error::VaribadError::ConfigError(format!(
            "{} tasks given for {} environments",
            tasks.len(),
            targets.len()
        ))
        .into()),
    }
}
