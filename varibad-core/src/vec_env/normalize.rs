use super::{EnvSpec, RunningMeanStd, VecEnv, VecStep};
use crate::Act;
use anyhow::Result;

const EPSILON: f64 = 1e-8;

/// Normalises rewards by the running standard deviation of discounted returns.
///
/// Rewards of a step are normalised with the statistics accumulated up to the previous
/// step; the statistics are then updated with the returns including the current step.
/// Raw rewards are passed through in [`VecStep::rewards_raw`].
pub struct VecNormalize<V: VecEnv> {
    venv: V,
    normalise_rew: bool,
    training: bool,
    gamma: f64,
    clip_reward: f64,
    ret: Vec<f64>,
    ret_rms: RunningMeanStd,
    pending_reset: Option<Option<usize>>,
}

impl<V: VecEnv> VecNormalize<V> {
    /// Wraps a vectorized environment.
    pub fn new(
        venv: V,
        normalise_rew: bool,
        gamma: f64,
        clip_reward: f64,
        ret_rms: Option<RunningMeanStd>,
    ) -> Self {
        let n = venv.num_envs();
        Self {
            venv,
            normalise_rew,
            training: true,
            gamma,
            clip_reward,
            ret: vec![0.0; n],
            ret_rms: ret_rms.unwrap_or_else(|| RunningMeanStd::new(1)),
            pending_reset: None,
        }
    }

    /// If `false`, the statistics are frozen.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Statistics of the discounted returns.
    pub fn running_stats(&self) -> &RunningMeanStd {
        &self.ret_rms
    }

    /// Replaces the statistics, e.g., with those loaded from a checkpoint.
    pub fn set_running_stats(&mut self, ret_rms: RunningMeanStd) {
        self.ret_rms = ret_rms;
    }

    fn normalise(&self, rewards: &[f32]) -> Vec<f32> {
        let std = (self.ret_rms.var[0] + EPSILON).sqrt();
        rewards
            .iter()
            .map(|&r| (r as f64 / std).clamp(-self.clip_reward, self.clip_reward) as f32)
            .collect()
    }
}

impl<V: VecEnv> VecEnv for VecNormalize<V> {
    fn spec(&self) -> &EnvSpec {
        self.venv.spec()
    }

    fn num_envs(&self) -> usize {
        self.venv.num_envs()
    }

    fn reset_async(&mut self, index: Option<usize>, tasks: Option<Vec<Vec<f32>>>) -> Result<()> {
        self.venv.reset_async(index, tasks)?;
        self.pending_reset = Some(index);
        Ok(())
    }

    fn reset_wait(&mut self) -> Result<Vec<Vec<f32>>> {
        match self.pending_reset.take() {
            Some(Some(i)) => self.ret[i] = 0.0,
            Some(None) => self.ret.iter_mut().for_each(|r| *r = 0.0),
            None => {}
        }
        self.venv.reset_wait()
    }

    fn step_async(&mut self, acts: Vec<Act>) -> Result<()> {
        self.venv.step_async(acts)
    }

    fn step_wait(&mut self) -> Result<VecStep> {
        let mut step = self.venv.step_wait()?;

        if self.normalise_rew {
            step.rewards_normalised = self.normalise(&step.rewards_raw);
            if self.training {
                for (ret, &r) in self.ret.iter_mut().zip(step.rewards_raw.iter()) {
                    *ret = *ret * self.gamma + r as f64;
                }
                let batch: Vec<Vec<f64>> = self.ret.iter().map(|&r| vec![r]).collect();
                self.ret_rms.update(&batch);
            }
        }
        for i in step.done_indices() {
            self.ret[i] = 0.0;
        }

        Ok(step)
    }

    fn reset_mdp(&mut self, index: Option<usize>) -> Result<Vec<Vec<f32>>> {
        self.venv.reset_mdp(index)
    }

    fn get_task(&self) -> Result<Vec<Vec<f32>>> {
        self.venv.get_task()
    }

    fn get_belief(&self) -> Result<Option<Vec<Vec<f32>>>> {
        self.venv.get_belief()
    }

    fn ret_rms(&self) -> Option<&RunningMeanStd> {
        match self.normalise_rew {
            true => Some(&self.ret_rms),
            false => None,
        }
    }
}
