use crate::encoder::Latent;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::{rngs::SmallRng, seq::SliceRandom};
use varibad_core::error::VaribadError;

/// Dimensions of [`OnlineStorage`].
#[derive(Debug, Clone, PartialEq)]
pub struct OnlineStorageConfig {
    /// Length `T` of a rollout window.
    pub num_steps: usize,

    /// The number of workers `N`.
    pub num_processes: usize,

    /// Dimension of states.
    pub state_dim: usize,

    /// Dimension of actions.
    pub action_dim: usize,

    /// Dimension of beliefs, `None` if beliefs are not stored.
    pub belief_dim: Option<usize>,

    /// Dimension of tasks, `None` if tasks are not stored.
    pub task_dim: Option<usize>,

    /// Size of the encoder hidden state.
    pub hidden_size: usize,

    /// If `true`, returns are computed from normalised rewards.
    pub normalise_rewards: bool,
}

/// Data of one rollout step of all workers, each tensor `[num_processes, dim]`.
pub struct RolloutStep {
    /// State after the step, replaced by the initial state for reset workers.
    pub state: Tensor,

    /// State after the step, before any reset.
    pub next_state: Tensor,

    /// Belief after the step.
    pub belief: Option<Tensor>,

    /// Task after the step.
    pub task: Option<Tensor>,

    /// Actions taken.
    pub actions: Tensor,

    /// Log-probabilities of the actions.
    pub action_log_probs: Tensor,

    /// Rewards from the environments.
    pub rewards_raw: Tensor,

    /// Normalised rewards.
    pub rewards_normalised: Tensor,

    /// Value estimates of the states before the step.
    pub value_preds: Tensor,

    /// `0.0` where the BAMDP episode ended.
    pub masks: Tensor,

    /// `0.0` where the episode ended by the time limit.
    pub bad_masks: Tensor,

    /// BAMDP done flags.
    pub done: Vec<bool>,

    /// Latent and hidden state after encoding the step.
    pub latent: Latent,
}

/// Mini-batch of flattened rollout data, each tensor `[batch, dim]`.
#[derive(Debug, Clone)]
pub struct MiniBatch {
    /// States.
    pub state: Tensor,

    /// Beliefs.
    pub belief: Option<Tensor>,

    /// Tasks.
    pub task: Option<Tensor>,

    /// Latent samples.
    pub latent_sample: Tensor,

    /// Latent means.
    pub latent_mean: Tensor,

    /// Latent log-variances.
    pub latent_logvar: Tensor,

    /// Actions.
    pub actions: Tensor,

    /// Value estimates at collection time.
    pub value_preds: Tensor,

    /// Returns.
    pub returns: Tensor,

    /// Log-probabilities of the actions at collection time.
    pub old_action_log_probs: Tensor,

    /// Advantages.
    pub adv_targ: Tensor,

    /// Rows of the flattened window, `[batch]`.
    pub indices: Tensor,
}

/// Rollout buffer of `T` steps of `N` workers used for policy updates.
///
/// Per-step lists indexed by `t + 1` (states, beliefs, tasks, hidden states, values,
/// masks, done flags) have `T + 1` entries; entry `0` carries over the last entry of
/// the previous window in [`OnlineStorage::after_update`]. The latent lists grow by one
/// per step, starting with the latent before the first step, and are replaced as a
/// whole when embeddings are recomputed.
pub struct OnlineStorage {
    pub(crate) num_steps: usize,
    pub(crate) num_processes: usize,
    pub(crate) normalise_rewards: bool,
    pub(crate) step: usize,

    pub(crate) prev_state: Vec<Tensor>,
    pub(crate) next_state: Vec<Tensor>,
    pub(crate) beliefs: Option<Vec<Tensor>>,
    pub(crate) tasks: Option<Vec<Tensor>>,

    pub(crate) latent_samples: Vec<Tensor>,
    pub(crate) latent_mean: Vec<Tensor>,
    pub(crate) latent_logvar: Vec<Tensor>,
    pub(crate) hidden_states: Vec<Tensor>,

    pub(crate) actions: Vec<Tensor>,
    pub(crate) action_log_probs: Vec<Tensor>,
    pub(crate) rewards_raw: Vec<Tensor>,
    pub(crate) rewards_normalised: Vec<Tensor>,
    pub(crate) value_preds: Vec<Tensor>,
    pub(crate) returns: Vec<Tensor>,
    pub(crate) masks: Vec<Tensor>,
    pub(crate) bad_masks: Vec<Tensor>,
    pub(crate) done: Vec<Vec<bool>>,
}

fn zeros(n: usize, shape: (usize, usize), device: &Device) -> Result<Vec<Tensor>> {
    let t = Tensor::zeros(shape, DType::F32, device)?;
    Ok(vec![t; n])
}

fn ones(n: usize, shape: (usize, usize), device: &Device) -> Result<Vec<Tensor>> {
    let t = Tensor::ones(shape, DType::F32, device)?;
    Ok(vec![t; n])
}

/// `[T, N]` host values of a list of `[N, 1]` tensors.
fn columns(ts: &[Tensor]) -> Result<Vec<Vec<f32>>> {
    Ok(Tensor::stack(ts, 0)?.squeeze(2)?.to_vec2::<f32>()?)
}

impl OnlineStorage {
    /// Creates a storage filled with zeros, masks set to one.
    pub fn new(config: &OnlineStorageConfig, device: &Device) -> Result<Self> {
        let (t, n) = (config.num_steps, config.num_processes);
        if t == 0 || n == 0 {
            return Err(VaribadError::ConfigError(
                "rollout window and number of workers must be positive".into(),
            )
            .into());
        }

        Ok(Self {
            num_steps: t,
            num_processes: n,
            normalise_rewards: config.normalise_rewards,
            step: 0,
            prev_state: zeros(t + 1, (n, config.state_dim), device)?,
            next_state: zeros(t, (n, config.state_dim), device)?,
            beliefs: match config.belief_dim {
                Some(d) => Some(zeros(t + 1, (n, d), device)?),
                None => None,
            },
            tasks: match config.task_dim {
                Some(d) => Some(zeros(t + 1, (n, d), device)?),
                None => None,
            },
            latent_samples: Vec::with_capacity(t + 1),
            latent_mean: Vec::with_capacity(t + 1),
            latent_logvar: Vec::with_capacity(t + 1),
            hidden_states: zeros(t + 1, (n, config.hidden_size), device)?,
            actions: zeros(t, (n, config.action_dim), device)?,
            action_log_probs: zeros(t, (n, 1), device)?,
            rewards_raw: zeros(t, (n, 1), device)?,
            rewards_normalised: zeros(t, (n, 1), device)?,
            value_preds: zeros(t + 1, (n, 1), device)?,
            returns: zeros(t + 1, (n, 1), device)?,
            masks: ones(t + 1, (n, 1), device)?,
            bad_masks: ones(t + 1, (n, 1), device)?,
            done: vec![vec![false; n]; t + 1],
        })
    }

    /// Length of the rollout window.
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// The number of workers.
    pub fn num_processes(&self) -> usize {
        self.num_processes
    }

    /// The number of steps inserted in the current window.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Sets the observations before the first step of a training run.
    pub fn set_initial(
        &mut self,
        state: Tensor,
        belief: Option<Tensor>,
        task: Option<Tensor>,
    ) {
        self.prev_state[0] = state;
        if let (Some(beliefs), Some(b)) = (self.beliefs.as_mut(), belief) {
            beliefs[0] = b;
        }
        if let (Some(tasks), Some(t)) = (self.tasks.as_mut(), task) {
            tasks[0] = t;
        }
    }

    /// Sets the latent and hidden state before the first step of the window.
    pub fn push_prior(&mut self, latent: &Latent) -> Result<()> {
        if !self.latent_mean.is_empty() {
            return Err(VaribadError::ConfigError(
                "latents of the previous window were not cleared".into(),
            )
            .into());
        }
        self.hidden_states[0] = latent.hidden.clone();
        self.latent_samples.push(latent.sample.clone());
        self.latent_mean.push(latent.mean.clone());
        self.latent_logvar.push(latent.logvar.clone());
        Ok(())
    }

    /// Inserts one rollout step.
    pub fn insert(&mut self, step: RolloutStep) -> Result<()> {
        if self.step >= self.num_steps {
            return Err(VaribadError::ConfigError("rollout storage is full".into()).into());
        }
        let t = self.step;

        self.prev_state[t + 1] = step.state;
        self.next_state[t] = step.next_state;
        if let (Some(beliefs), Some(b)) = (self.beliefs.as_mut(), step.belief) {
            beliefs[t + 1] = b;
        }
        if let (Some(tasks), Some(task)) = (self.tasks.as_mut(), step.task) {
            tasks[t + 1] = task;
        }
        self.actions[t] = step.actions;
        self.action_log_probs[t] = step.action_log_probs;
        self.rewards_raw[t] = step.rewards_raw;
        self.rewards_normalised[t] = step.rewards_normalised;
        self.value_preds[t] = step.value_preds;
        self.masks[t + 1] = step.masks;
        self.bad_masks[t + 1] = step.bad_masks;
        self.done[t + 1] = step.done;
        self.hidden_states[t + 1] = step.latent.hidden;
        self.latent_samples.push(step.latent.sample);
        self.latent_mean.push(step.latent.mean);
        self.latent_logvar.push(step.latent.logvar);

        self.step += 1;
        Ok(())
    }

    /// Carries the last entries over to the next window and clears the latents.
    pub fn after_update(&mut self) {
        let t = self.num_steps;
        self.prev_state[0] = self.prev_state[t].clone();
        if let Some(beliefs) = self.beliefs.as_mut() {
            beliefs[0] = beliefs[t].clone();
        }
        if let Some(tasks) = self.tasks.as_mut() {
            tasks[0] = tasks[t].clone();
        }
        self.hidden_states[0] = self.hidden_states[t].clone();
        self.masks[0] = self.masks[t].clone();
        self.bad_masks[0] = self.bad_masks[t].clone();
        self.done[0] = self.done[t].clone();
        self.latent_samples.clear();
        self.latent_mean.clear();
        self.latent_logvar.clear();
        self.step = 0;
    }

    /// Computes the returns of the window given the value of the state after it.
    ///
    /// With `use_proper_time_limits`, steps where the episode ended by the time limit
    /// (`bad_masks == 0`) bootstrap from the value estimate instead of being treated as
    /// terminal. True terminations (`masks == 0`, `bad_masks == 1`) cut the bootstrap.
    pub fn compute_returns(
        &mut self,
        next_value: &Tensor,
        use_gae: bool,
        gamma: f32,
        tau: f32,
        use_proper_time_limits: bool,
    ) -> Result<()> {
        let (t_max, n) = (self.num_steps, self.num_processes);
        let device = next_value.device().clone();
        self.value_preds[t_max] = next_value.detach();

        let rewards = match self.normalise_rewards {
            true => columns(&self.rewards_normalised)?,
            false => columns(&self.rewards_raw)?,
        };
        let values = columns(&self.value_preds)?;
        let masks = columns(&self.masks)?;
        let bad_masks = match use_proper_time_limits {
            true => columns(&self.bad_masks)?,
            false => vec![vec![1f32; n]; t_max + 1],
        };

        let mut returns = vec![vec![0f32; n]; t_max + 1];
        returns[t_max] = values[t_max].clone();
        for i in 0..n {
            let mut gae = 0f32;
            for t in (0..t_max).rev() {
                let (r, m, bm) = (rewards[t][i], masks[t + 1][i], bad_masks[t + 1][i]);
                returns[t][i] = match use_gae {
                    true => {
                        let delta = r + gamma * values[t + 1][i] * m - values[t][i];
                        gae = (delta + gamma * tau * m * gae) * bm;
                        gae + values[t][i]
                    }
                    false => {
                        (returns[t + 1][i] * gamma * m + r) * bm + (1.0 - bm) * values[t][i]
                    }
                };
            }
        }

        self.returns = returns
            .iter()
            .map(|r| -> Result<Tensor> { Ok(Tensor::from_slice(r, (n, 1), &device)?) })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Advantages `returns - value_preds` of the window, `[T * N, 1]`.
    pub fn advantages(&self) -> Result<Tensor> {
        let t = self.num_steps;
        let returns = Tensor::cat(&self.returns[..t], 0)?;
        let values = Tensor::cat(&self.value_preds[..t], 0)?;
        Ok((returns - values)?)
    }

    /// Latent samples, means and log-variances at the given rows of the flattened window.
    ///
    /// Used after embeddings were recomputed with gradients for a mini-batch.
    pub fn latents_at(&self, indices: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let t = self.num_steps;
        let sel = |ts: &[Tensor]| -> Result<Tensor> {
            Ok(Tensor::cat(&ts[..t], 0)?.index_select(indices, 0)?)
        };
        Ok((
            sel(&self.latent_samples)?,
            sel(&self.latent_mean)?,
            sel(&self.latent_logvar)?,
        ))
    }

    /// Splits the window into `num_mini_batch` random mini-batches.
    ///
    /// Steps that do not fill a whole mini-batch are dropped.
    pub fn feed_forward_generator(
        &self,
        advantages: &Tensor,
        num_mini_batch: usize,
        rng: &mut SmallRng,
    ) -> Result<Vec<MiniBatch>> {
        let t = self.num_steps;
        let batch_size = t * self.num_processes;
        if num_mini_batch == 0 || num_mini_batch > batch_size {
            return Err(VaribadError::ConfigError(format!(
                "{} mini-batches requested from {} steps",
                num_mini_batch, batch_size
            ))
            .into());
        }
        if self.latent_mean.len() != t + 1 {
            return Err(VaribadError::ConfigError(format!(
                "{} latents stored for a window of {} steps",
                self.latent_mean.len(),
                t
            ))
            .into());
        }
        let mini_batch_size = batch_size / num_mini_batch;

        let flat = |ts: &[Tensor]| -> Result<Tensor> { Ok(Tensor::cat(&ts[..t], 0)?) };
        let state = flat(&self.prev_state)?;
        let belief = match &self.beliefs {
            Some(b) => Some(flat(b)?),
            None => None,
        };
        let task = match &self.tasks {
            Some(b) => Some(flat(b)?),
            None => None,
        };
        let latent_sample = flat(&self.latent_samples)?;
        let latent_mean = flat(&self.latent_mean)?;
        let latent_logvar = flat(&self.latent_logvar)?;
        let actions = flat(&self.actions)?;
        let value_preds = flat(&self.value_preds)?;
        let returns = flat(&self.returns)?;
        let old_action_log_probs = flat(&self.action_log_probs)?;

        let mut indices: Vec<u32> = (0..batch_size as u32).collect();
        indices.shuffle(rng);

        let device = state.device().clone();
        indices
            .chunks_exact(mini_batch_size)
            .map(|ixs| -> Result<MiniBatch> {
                let ixs = Tensor::from_slice(ixs, ixs.len(), &device)?;
                let sel = |t: &Tensor| t.index_select(&ixs, 0);
                Ok(MiniBatch {
                    state: sel(&state)?,
                    belief: belief.as_ref().map(|b| sel(b)).transpose()?,
                    task: task.as_ref().map(|b| sel(b)).transpose()?,
                    latent_sample: sel(&latent_sample)?,
                    latent_mean: sel(&latent_mean)?,
                    latent_logvar: sel(&latent_logvar)?,
                    actions: sel(&actions)?,
                    value_preds: sel(&value_preds)?,
                    returns: sel(&returns)?,
                    old_action_log_probs: sel(&old_action_log_probs)?,
                    adv_targ: sel(advantages)?,
                    indices: ixs.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;

    fn config(t: usize, n: usize) -> OnlineStorageConfig {
        OnlineStorageConfig {
            num_steps: t,
            num_processes: n,
            state_dim: 2,
            action_dim: 1,
            belief_dim: None,
            task_dim: Some(2),
            hidden_size: 4,
            normalise_rewards: false,
        }
    }

    fn col(v: &[f32]) -> Tensor {
        Tensor::from_slice(v, (v.len(), 1), &Device::Cpu).unwrap()
    }

    fn latent(n: usize, v: f32) -> Latent {
        let t = (Tensor::ones((n, 3), DType::F32, &Device::Cpu).unwrap() * v as f64).unwrap();
        Latent {
            sample: t.clone(),
            mean: t.clone(),
            logvar: t,
            hidden: Tensor::zeros((n, 4), DType::F32, &Device::Cpu).unwrap(),
        }
    }

    fn rollout_step(n: usize, reward: f32, value: f32, done: Vec<bool>, bad: Vec<bool>) -> RolloutStep {
        let state = Tensor::zeros((n, 2), DType::F32, &Device::Cpu).unwrap();
        RolloutStep {
            next_state: state.clone(),
            state,
            belief: None,
            task: Some(Tensor::ones((n, 2), DType::F32, &Device::Cpu).unwrap()),
            actions: Tensor::zeros((n, 1), DType::F32, &Device::Cpu).unwrap(),
            action_log_probs: Tensor::zeros((n, 1), DType::F32, &Device::Cpu).unwrap(),
            rewards_raw: col(&vec![reward; n]),
            rewards_normalised: col(&vec![reward; n]),
            value_preds: col(&vec![value; n]),
            masks: col(&done.iter().map(|&d| if d { 0.0 } else { 1.0 }).collect::<Vec<_>>()),
            bad_masks: col(&bad.iter().map(|&d| if d { 0.0 } else { 1.0 }).collect::<Vec<_>>()),
            done,
            latent: latent(n, 0.0),
        }
    }

    #[test]
    fn test_time_limit_is_not_terminal() -> Result<()> {
        // worker 0 hits the time limit, worker 1 terminates
        for use_gae in [false, true] {
            let mut storage = OnlineStorage::new(&config(1, 2), &Device::Cpu)?;
            storage.push_prior(&latent(2, 0.0))?;
            storage.insert(rollout_step(2, 1.0, 0.5, vec![true, true], vec![true, false]))?;
            storage.compute_returns(&col(&[2.0, 2.0]), use_gae, 0.9, 0.95, true)?;
            let returns = columns(&storage.returns)?;
            assert!((returns[0][0] - 0.5).abs() < 1e-6);
            assert!((returns[0][1] - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_returns_without_time_limit_handling() -> Result<()> {
        let mut storage = OnlineStorage::new(&config(2, 1), &Device::Cpu)?;
        storage.push_prior(&latent(1, 0.0))?;
        storage.insert(rollout_step(1, 1.0, 0.0, vec![false], vec![false]))?;
        storage.insert(rollout_step(1, 1.0, 0.0, vec![false], vec![false]))?;
        storage.compute_returns(&col(&[10.0]), false, 0.5, 1.0, false)?;
        let returns = columns(&storage.returns)?;
        // r + 0.5 * (r + 0.5 * 10)
        assert!((returns[0][0] - 4.0).abs() < 1e-6);
        assert!((returns[1][0] - 6.0).abs() < 1e-6);

        // GAE with tau = 1 and zero values equals discounted returns
        storage.compute_returns(&col(&[10.0]), true, 0.5, 1.0, false)?;
        let gae_returns = columns(&storage.returns)?;
        assert!((gae_returns[0][0] - 4.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_after_update_and_mini_batches() -> Result<()> {
        let mut storage = OnlineStorage::new(&config(3, 2), &Device::Cpu)?;
        storage.push_prior(&latent(2, 0.0))?;
        assert!(storage.push_prior(&latent(2, 0.0)).is_err());
        for _ in 0..3 {
            storage.insert(rollout_step(2, 1.0, 0.0, vec![false, true], vec![false, false]))?;
        }
        assert!(storage
            .insert(rollout_step(2, 1.0, 0.0, vec![false, false], vec![false, false]))
            .is_err());
        assert_eq!(storage.latent_mean.len(), 4);

        storage.compute_returns(&col(&[0.0, 0.0]), false, 0.99, 0.95, true)?;
        let adv = storage.advantages()?;
        assert_eq!(adv.dims(), [6, 1]);

        let mut rng = SmallRng::seed_from_u64(0);
        let batches = storage.feed_forward_generator(&adv, 2, &mut rng)?;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].state.dims(), [3, 2]);
        assert_eq!(batches[0].latent_mean.dims(), [3, 3]);
        assert!(batches[0].belief.is_none());
        assert_eq!(batches[0].task.as_ref().unwrap().dims(), [3, 2]);

        storage.after_update();
        assert_eq!(storage.step(), 0);
        assert!(storage.latent_mean.is_empty());
        assert_eq!(storage.done[0], vec![false, true]);
        assert_eq!(columns(&storage.masks[..1])?, vec![vec![1.0, 0.0]]);
        Ok(())
    }
}
