use super::{
    base::{env_context, policy_input, reset_done},
    MetaLearnerConfig,
};
use crate::{
    encoder::RnnEncoder,
    policy::ActorCritic,
    util::{column_to_tensor, rows_to_tensor},
};
use anyhow::Result;
use candle_core::Device;
use rand::rngs::SmallRng;
use varibad_core::{
    record::{Record, RecordValue},
    vec_env::{make_vec_envs, RunningMeanStd, VecEnv},
    Boundary, EnvBuilder,
};

/// Undiscounted returns of an evaluation run.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    /// `returns[i][k]` is the return of worker `i` in inner episode `k`.
    pub returns: Vec<Vec<f32>>,
}

impl EvalResult {
    fn episodes_per_task(&self) -> usize {
        self.returns.first().map_or(0, |r| r.len())
    }

    /// Average return of each inner episode over workers.
    pub fn mean_per_episode(&self) -> Vec<f32> {
        let n = self.returns.len().max(1) as f32;
        (0..self.episodes_per_task())
            .map(|k| self.returns.iter().map(|r| r[k]).sum::<f32>() / n)
            .collect()
    }

    /// Standard deviation of the return of each inner episode over workers.
    pub fn std_per_episode(&self) -> Vec<f32> {
        let n = self.returns.len().max(1) as f32;
        self.mean_per_episode()
            .iter()
            .enumerate()
            .map(|(k, m)| {
                let var = self.returns.iter().map(|r| (r[k] - m).powi(2)).sum::<f32>() / n;
                var.sqrt()
            })
            .collect()
    }

    /// Sum of the average returns of the inner episodes.
    pub fn meta_episode_return(&self) -> f32 {
        self.mean_per_episode().iter().sum()
    }

    /// Returns per inner episode, averaged over workers, with `episode_k` counted from 1.
    ///
    /// The averages are also recorded together as an array.
    pub fn to_record(&self) -> Record {
        let mut record = Record::empty();
        for (k, (m, s)) in self
            .mean_per_episode()
            .into_iter()
            .zip(self.std_per_episode())
            .enumerate()
        {
            record.insert(
                format!("return_avg_per_iter/episode_{}", k + 1),
                RecordValue::Scalar(m),
            );
            record.insert(
                format!("return_std_per_iter/episode_{}", k + 1),
                RecordValue::Scalar(s),
            );
        }
        record.insert(
            "Meta-Episode Return",
            RecordValue::Scalar(self.meta_episode_return()),
        );
        record.insert(
            "return_avg_per_iter/all_episodes",
            RecordValue::Array1(self.mean_per_episode()),
        );
        record
    }
}

/// Runs one BAMDP episode on each of `num_eval_processes` fresh workers.
///
/// Actions are deterministic and the encoder starts from the prior. Rewards are
/// normalised with a frozen copy of `ret_rms` only for the environments' bookkeeping;
/// the reported returns are raw.
#[allow(clippy::too_many_arguments)]
pub(super) fn evaluate<B: EnvBuilder>(
    config: &MetaLearnerConfig,
    builder: &B,
    policy: &ActorCritic,
    encoder: &RnnEncoder,
    ret_rms: Option<RunningMeanStd>,
    iter_idx: usize,
    device: &Device,
    rng: &mut SmallRng,
) -> Result<EvalResult> {
    let n = config.num_eval_processes;
    let env_config = config
        .vec_env_config()
        .num_processes(n)
        .seed(config.seed * 42 + iter_idx as u64);
    let mut envs = make_vec_envs(builder.clone(), &env_config, ret_rms)?;
    envs.set_training(false);
    let spec = envs.spec().clone();
    let k = spec.episodes_per_task;
    let sample = !config.vae.disable_stochasticity_in_latent;

    let mut returns = vec![vec![0f32; k]; n];
    let mut episode = vec![0usize; n];
    let mut finished = vec![false; n];

    let mut obs = envs.reset(None, None)?;
    let (mut belief, mut task) = env_context(&envs, &config.policy, device)?;
    let mut latent = encoder.prior(n, sample, rng)?;

    for _ in 0..spec.horizon {
        let state = rows_to_tensor(&obs, spec.state_dim, device)?;
        let input = policy_input(config, &state, &belief, &task, &latent)?;
        let (_, action, _) = policy.act(&input, true, rng)?;
        let step = envs.step(action.to_vec2::<f32>()?)?;

        for (i, boundary) in step.boundaries.iter().enumerate() {
            if finished[i] {
                continue;
            }
            returns[i][episode[i]] += step.rewards_raw[i];
            match boundary {
                Boundary::Continuing => {}
                Boundary::InnerBoundary { .. } => episode[i] = (episode[i] + 1).min(k - 1),
                Boundary::FinalBoundary => finished[i] = true,
            }
        }
        if finished.iter().all(|&f| f) {
            break;
        }

        let done = step.done();
        let next_state = rows_to_tensor(&step.obs, spec.state_dim, device)?;
        let rewards = column_to_tensor(&step.rewards_raw, device)?;
        let h = encoder.reset_hidden(&latent.hidden, &done)?;
        latent = encoder
            .forward_step(&h, &action, &next_state, &rewards, &state, sample, rng)?
            .detach();

        obs = step.obs.clone();
        reset_done(&mut envs, &mut obs, &step.done_indices())?;
        let context = env_context(&envs, &config.policy, device)?;
        belief = context.0;
        task = context.1;
    }

    Ok(EvalResult { returns })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_eval_result() {
        let result = EvalResult {
            returns: vec![vec![1.0, 3.0], vec![3.0, 5.0]],
        };
        assert_eq!(result.mean_per_episode(), vec![2.0, 4.0]);
        assert_eq!(result.std_per_episode(), vec![1.0, 1.0]);
        assert_eq!(result.meta_episode_return(), 6.0);

        let record = result.to_record();
        assert_eq!(record.get_scalar("return_avg_per_iter/episode_2").unwrap(), 4.0);
        assert_eq!(record.get_scalar("return_std_per_iter/episode_1").unwrap(), 1.0);
        assert_eq!(record.get_scalar("Meta-Episode Return").unwrap(), 6.0);
        assert_eq!(
            record.get_array1("return_avg_per_iter/all_episodes").unwrap(),
            vec![2.0, 4.0]
        );
    }
}
