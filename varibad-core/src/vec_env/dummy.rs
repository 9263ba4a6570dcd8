use super::{
    base::{target_indices, tasks_for},
    make_worker_env, EnvSpec, VecEnv, VecStep, WorkerEnv,
};
use crate::{error::VaribadError, Act, BamdpConfig, EnvBuilder, MetaEnv};
use anyhow::Result;

/// Runs environments sequentially in the calling thread.
pub struct DummyVecEnv<E: MetaEnv> {
    envs: Vec<WorkerEnv<E>>,
    spec: EnvSpec,
    pending_acts: Option<Vec<Act>>,
    pending_reset: Option<(Vec<usize>, Vec<Option<Vec<f32>>>)>,
}

impl<E: MetaEnv + 'static> DummyVecEnv<E> {
    /// Builds `n` environments.
    pub fn build<B: EnvBuilder<Env = E>>(
        builder: &B,
        n: usize,
        seed: u64,
        config: &BamdpConfig,
    ) -> Result<Self> {
        let envs = (0..n)
            .map(|rank| make_worker_env(builder, seed, rank, config))
            .collect::<Result<Vec<_>>>()?;
        let spec = match envs.first() {
            Some(env) => EnvSpec::of(env),
            None => {
                return Err(
                    VaribadError::ConfigError("no environment to vectorize".into()).into(),
                )
            }
        };

        Ok(Self {
            envs,
            spec,
            pending_acts: None,
            pending_reset: None,
        })
    }

    /// The wrapped environments.
    pub fn envs(&self) -> &[WorkerEnv<E>] {
        &self.envs
    }
}

impl<E: MetaEnv + 'static> VecEnv for DummyVecEnv<E> {
    fn spec(&self) -> &EnvSpec {
        &self.spec
    }

    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn reset_async(&mut self, index: Option<usize>, tasks: Option<Vec<Vec<f32>>>) -> Result<()> {
        let targets = target_indices(index, self.envs.len())?;
        let tasks = tasks_for(&targets, tasks)?;
        self.pending_reset = Some((targets, tasks));
        Ok(())
    }

    fn reset_wait(&mut self) -> Result<Vec<Vec<f32>>> {
        let (targets, tasks) = self
            .pending_reset
            .take()
            .ok_or_else(|| VaribadError::ConfigError("reset_wait without reset_async".into()))?;
        targets
            .into_iter()
            .zip(tasks.into_iter())
            .map(|(i, task)| self.envs[i].reset(task.as_deref()))
            .collect()
    }

    fn step_async(&mut self, acts: Vec<Act>) -> Result<()> {
        if acts.len() != self.envs.len() {
            return Err(VaribadError::ConfigError(format!(
                "{} actions given for {} environments",
                acts.len(),
                self.envs.len()
            ))
            .into());
        }
        self.pending_acts = Some(acts);
        Ok(())
    }

    fn step_wait(&mut self) -> Result<VecStep> {
        let acts = self
            .pending_acts
            .take()
            .ok_or_else(|| VaribadError::ConfigError("step_wait without step_async".into()))?;
        let steps = self
            .envs
            .iter_mut()
            .zip(acts.iter())
            .map(|(env, act)| env.step(act))
            .collect::<Result<Vec<_>>>()?;
        Ok(VecStep::from_steps(steps))
    }

    fn reset_mdp(&mut self, index: Option<usize>) -> Result<Vec<Vec<f32>>> {
        target_indices(index, self.envs.len())?
            .into_iter()
            .map(|i| self.envs[i].reset_mdp())
            .collect()
    }

    fn get_task(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.envs.iter().map(|env| env.get_task()).collect())
    }

    fn get_belief(&self) -> Result<Option<Vec<Vec<f32>>>> {
        Ok(self.envs.iter().map(|env| env.get_belief()).collect())
    }
}
