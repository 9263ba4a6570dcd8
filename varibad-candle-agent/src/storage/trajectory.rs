use crate::encoder::TrajectoryInput;
use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::{rngs::SmallRng, seq::index::sample};
use std::collections::VecDeque;
use varibad_core::error::VaribadError;

#[derive(Debug, Clone)]
struct Transition {
    prev_state: Vec<f32>,
    action: Vec<f32>,
    next_state: Vec<f32>,
    reward: f32,
    task: Option<Vec<f32>>,
}

type Trajectory = Vec<Transition>;

/// Zero-padded trajectories with their lengths.
#[derive(Debug, Clone)]
pub struct TrajectoryBatch {
    /// Transitions, `[max_len, batch, dim]`.
    pub input: TrajectoryInput,

    /// Task of each trajectory, `[batch, task_dim]`, if tasks were stored.
    pub tasks: Option<Tensor>,

    /// The number of valid timesteps of each trajectory.
    pub lens: Vec<usize>,
}

/// Per-worker trajectory storage used for training the VAE.
///
/// Each worker appends to its running trajectory at every step. When the task of a
/// worker is reset, its running trajectory is finalized, i.e., moved to the ring of
/// completed trajectories, and a new running trajectory is started. Inner episode
/// boundaries do not finalize trajectories.
pub struct VaeStorage {
    num_processes: usize,
    max_trajectories: usize,
    state_dim: usize,
    action_dim: usize,
    task_dim: usize,
    max_trajectory_len: usize,
    running: Vec<Trajectory>,
    completed: VecDeque<Trajectory>,
}

impl VaeStorage {
    /// Creates an empty storage.
    ///
    /// At most `max_trajectories` completed trajectories are kept; the oldest ones are
    /// evicted first.
    pub fn new(
        num_processes: usize,
        max_trajectories: usize,
        state_dim: usize,
        action_dim: usize,
        task_dim: usize,
    ) -> Self {
        Self {
            num_processes,
            max_trajectories,
            state_dim,
            action_dim,
            task_dim,
            max_trajectory_len: 0,
            running: vec![vec![]; num_processes],
            completed: VecDeque::with_capacity(max_trajectories),
        }
    }

    /// Reserves capacity of running trajectories so that appends do not reallocate.
    pub fn max_trajectory_len(mut self, v: usize) -> Self {
        self.max_trajectory_len = v;
        for t in self.running.iter_mut() {
            t.reserve(v);
        }
        self
    }

    /// Appends one transition per worker and finalizes trajectories of workers with `done`.
    pub fn insert(
        &mut self,
        prev_states: &[Vec<f32>],
        actions: &[Vec<f32>],
        next_states: &[Vec<f32>],
        rewards: &[f32],
        done: &[bool],
        tasks: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        let n = self.num_processes;
        if prev_states.len() != n
            || actions.len() != n
            || next_states.len() != n
            || rewards.len() != n
            || done.len() != n
            || tasks.map_or(false, |t| t.len() != n)
        {
            return Err(VaribadError::ConfigError(format!(
                "transitions of {} workers expected",
                n
            ))
            .into());
        }

        for i in 0..n {
            self.running[i].push(Transition {
                prev_state: prev_states[i].clone(),
                action: actions[i].clone(),
                next_state: next_states[i].clone(),
                reward: rewards[i],
                task: tasks.map(|t| t[i].clone()),
            });
            if done[i] {
                self.finalize(i);
            }
        }
        Ok(())
    }

    /// Moves the running trajectory of a worker to the completed trajectories.
    pub fn finalize(&mut self, worker: usize) {
        let trajectory = std::mem::replace(
            &mut self.running[worker],
            Vec::with_capacity(self.max_trajectory_len),
        );
        if trajectory.is_empty() || self.max_trajectories == 0 {
            return;
        }
        if self.completed.len() == self.max_trajectories {
            self.completed.pop_front();
        }
        self.completed.push_back(trajectory);
    }

    /// Lengths of the running trajectories.
    pub fn running_lens(&self) -> Vec<usize> {
        self.running.iter().map(|t| t.len()).collect()
    }

    /// Running trajectories of all workers, right-padded with zeros to the longest one.
    ///
    /// Use [`TrajectoryBatch::lens`] to pick the last valid timestep of each worker.
    pub fn get_running_batch(&self, device: &Device) -> Result<TrajectoryBatch> {
        let trajectories: Vec<&Trajectory> = self.running.iter().collect();
        self.pad(&trajectories, device)
    }

    /// Samples up to `n` completed trajectories without replacement.
    ///
    /// Returns `None` if no trajectory has been completed yet.
    pub fn sample_batch(
        &self,
        n: usize,
        rng: &mut SmallRng,
        device: &Device,
    ) -> Result<Option<TrajectoryBatch>> {
        if self.completed.is_empty() {
            return Ok(None);
        }
        let n = n.min(self.completed.len());
        let trajectories: Vec<&Trajectory> = sample(rng, self.completed.len(), n)
            .into_iter()
            .map(|i| &self.completed[i])
            .collect();
        Ok(Some(self.pad(&trajectories, device)?))
    }

    fn pad(&self, trajectories: &[&Trajectory], device: &Device) -> Result<TrajectoryBatch> {
        let batch_size = trajectories.len();
        let lens: Vec<usize> = trajectories.iter().map(|t| t.len()).collect();
        let max_len = lens.iter().copied().max().unwrap_or(0);
        let (sd, ad) = (self.state_dim, self.action_dim);

        let mut prev_states = vec![0f32; max_len * batch_size * sd];
        let mut next_states = vec![0f32; max_len * batch_size * sd];
        let mut actions = vec![0f32; max_len * batch_size * ad];
        let mut rewards = vec![0f32; max_len * batch_size];
        for (i, trajectory) in trajectories.iter().enumerate() {
            for (t, tr) in trajectory.iter().enumerate() {
                let k = t * batch_size + i;
                prev_states[k * sd..(k + 1) * sd].copy_from_slice(&tr.prev_state);
                next_states[k * sd..(k + 1) * sd].copy_from_slice(&tr.next_state);
                actions[k * ad..(k + 1) * ad].copy_from_slice(&tr.action);
                rewards[k] = tr.reward;
            }
        }

        let tasks = match trajectories
            .iter()
            .all(|t| t.first().map_or(false, |tr| tr.task.is_some()))
        {
            false => None,
            true => {
                let mut tasks: Vec<f32> = Vec::with_capacity(batch_size * self.task_dim);
                for t in trajectories.iter() {
                    if let Some(task) = t.first().and_then(|tr| tr.task.as_ref()) {
                        tasks.extend(task.iter().copied());
                    }
                }
                Some(Tensor::from_vec(tasks, (batch_size, self.task_dim), device)?)
            }
        };

        Ok(TrajectoryBatch {
            input: TrajectoryInput {
                prev_states: Tensor::from_vec(prev_states, (max_len, batch_size, sd), device)?,
                next_states: Tensor::from_vec(next_states, (max_len, batch_size, sd), device)?,
                actions: Tensor::from_vec(actions, (max_len, batch_size, ad), device)?,
                rewards: Tensor::from_vec(rewards, (max_len, batch_size, 1), device)?,
            },
            tasks,
            lens,
        })
    }

    /// The number of completed trajectories.
    pub fn len(&self) -> usize {
        self.completed.len()
    }

    /// Returns `true` if no trajectory has been completed.
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;

    fn step(storage: &mut VaeStorage, t: usize, done: &[bool]) -> Result<()> {
        let n = done.len();
        let states: Vec<Vec<f32>> = (0..n).map(|i| vec![(t + 1) as f32, i as f32]).collect();
        let actions: Vec<Vec<f32>> = (0..n).map(|_| vec![1.0]).collect();
        let rewards = vec![0.5; n];
        let tasks: Vec<Vec<f32>> = (0..n).map(|i| vec![i as f32]).collect();
        storage.insert(&states, &actions, &states, &rewards, done, Some(&tasks))
    }

    #[test]
    fn test_running_batch_padding() -> Result<()> {
        let mut storage = VaeStorage::new(3, 10, 2, 1, 1);

        // worker 2 gets a new task after 3 steps, worker 0 after 2 steps
        step(&mut storage, 0, &[false, false, false])?;
        step(&mut storage, 1, &[true, false, false])?;
        step(&mut storage, 2, &[false, false, true])?;
        step(&mut storage, 3, &[false, false, false])?;
        step(&mut storage, 4, &[false, false, false])?;
        step(&mut storage, 5, &[false, false, false])?;
        step(&mut storage, 6, &[false, false, false])?;
        assert_eq!(storage.running_lens(), vec![5, 7, 4]);
        assert_eq!(storage.len(), 2);

        let mut storage = VaeStorage::new(3, 10, 2, 1, 1);
        for t in 0..5 {
            step(&mut storage, t, &[false; 3])?;
        }
        storage.running[0].truncate(3);
        storage.running[2].truncate(2);

        let batch = storage.get_running_batch(&Device::Cpu)?;
        assert_eq!(batch.lens, vec![3, 5, 2]);
        assert_eq!(batch.input.next_states.dims(), [5, 3, 2]);
        assert_eq!(batch.input.rewards.dims(), [5, 3, 1]);

        let rewards = batch.input.rewards.to_vec3::<f32>()?;
        for (i, &len) in batch.lens.iter().enumerate() {
            for t in 0..5 {
                let expected = if t < len { 0.5 } else { 0.0 };
                assert_eq!(rewards[t][i][0], expected);
            }
        }
        let tasks = batch.tasks.unwrap().to_vec2::<f32>()?;
        assert_eq!(tasks, vec![vec![0.0], vec![1.0], vec![2.0]]);
        Ok(())
    }

    #[test]
    fn test_empty_running_batch() -> Result<()> {
        let storage = VaeStorage::new(2, 10, 3, 1, 0);
        let batch = storage.get_running_batch(&Device::Cpu)?;
        assert_eq!(batch.lens, vec![0, 0]);
        assert_eq!(batch.input.seq_len(), 0);
        assert_eq!(batch.input.batch_size(), 2);
        Ok(())
    }

    #[test]
    fn test_ring_eviction_and_sampling() -> Result<()> {
        let mut storage = VaeStorage::new(1, 2, 2, 1, 1);
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(storage.sample_batch(4, &mut rng, &Device::Cpu)?.is_none());

        // trajectories of lengths 1, 2 and 3
        for len in 1..=3 {
            for t in 0..len {
                step(&mut storage, t, &[t + 1 == len])?;
            }
        }
        assert_eq!(storage.len(), 2);

        let batch = storage.sample_batch(4, &mut rng, &Device::Cpu)?.unwrap();
        let mut lens = batch.lens.clone();
        lens.sort_unstable();
        assert_eq!(lens, vec![2, 3]);
        assert_eq!(batch.input.seq_len(), 3);
        Ok(())
    }
}
