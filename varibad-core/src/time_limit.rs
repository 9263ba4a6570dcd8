//! Marks inner episodes ended by the step limit.
use crate::{ActionSpace, EnvStep, EnvType, MetaEnv};
use anyhow::Result;

/// Flags `bad_transition` when an inner episode ends because the step limit was reached.
///
/// Returns with `bad_transition` unset are bootstrapped as true terminations.
pub struct TimeLimitMask<E: MetaEnv> {
    env: E,
}

impl<E: MetaEnv> TimeLimitMask<E> {
    /// Wraps an environment.
    pub fn new(env: E) -> Self {
        Self { env }
    }

    /// The wrapped environment.
    pub fn inner(&self) -> &E {
        &self.env
    }
}

impl<E: MetaEnv> MetaEnv for TimeLimitMask<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.env.reset()
    }

    fn step(&mut self, act: &[f32]) -> Result<EnvStep> {
        let mut step = self.env.step(act)?;
        if step.done && self.env.elapsed_steps() == self.env.max_episode_steps() {
            step.info.bad_transition = true;
        }
        Ok(step)
    }

    fn reset_task(&mut self, task: Option<&[f32]>) -> Result<Vec<f32>> {
        self.env.reset_task(task)
    }

    fn get_task(&self) -> Vec<f32> {
        self.env.get_task()
    }

    fn get_belief(&self) -> Option<Vec<f32>> {
        self.env.get_belief()
    }

    fn task_dim(&self) -> usize {
        self.env.task_dim()
    }

    fn belief_dim(&self) -> usize {
        self.env.belief_dim()
    }

    fn num_states(&self) -> Option<usize> {
        self.env.num_states()
    }

    fn max_episode_steps(&self) -> usize {
        self.env.max_episode_steps()
    }

    fn elapsed_steps(&self) -> usize {
        self.env.elapsed_steps()
    }

    fn observation_shape(&self) -> Vec<usize> {
        self.env.observation_shape()
    }

    fn action_space(&self) -> ActionSpace {
        self.env.action_space()
    }

    fn env_type(&self) -> EnvType {
        self.env.env_type()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::envs::{GridNavi, GridNaviConfig};

    #[test]
    fn test_bad_transition_at_step_limit() -> Result<()> {
        let config = GridNaviConfig::default().num_steps(3);
        let mut env = TimeLimitMask::new(GridNavi::build(&config, 0)?);
        env.reset_task(None)?;
        env.reset()?;

        let s1 = env.step(&[0.0])?;
        let s2 = env.step(&[0.0])?;
        let s3 = env.step(&[0.0])?;
        assert!(!s1.info.bad_transition && !s1.done);
        assert!(!s2.info.bad_transition && !s2.done);
        assert!(s3.info.bad_transition && s3.done);

        Ok(())
    }
}
