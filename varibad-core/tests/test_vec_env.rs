use anyhow::Result;
use varibad_core::{
    envs::{GridNaviBuilder, GridNaviConfig},
    error::VaribadError,
    vec_env::{make_vec_envs, VecEnv, VecEnvConfig},
    ActionSpace, EnvBuilder, EnvStep, Info, MetaEnv,
};

const PANIC_ACTION: f32 = -99.0;

/// Echoes the action as observation; episodes last `len` steps.
#[derive(Clone)]
struct Echo {
    len: usize,
    t: usize,
    rank: usize,
}

impl MetaEnv for Echo {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.t = 0;
        Ok(vec![self.rank as f32])
    }

    fn step(&mut self, act: &[f32]) -> Result<EnvStep> {
        // Later workers take longer, so replies arrive in reverse order
        std::thread::sleep(std::time::Duration::from_millis(5 * (4 - self.rank.min(4)) as u64));
        if act[0] == PANIC_ACTION {
            panic!("worker {} received the panic action", self.rank);
        }
        self.t += 1;
        Ok(EnvStep::new(act.to_vec(), act[0], self.t >= self.len, Info::default()))
    }

    fn reset_task(&mut self, task: Option<&[f32]>) -> Result<Vec<f32>> {
        match task {
            None => Ok(vec![]),
            Some(t) => Err(VaribadError::UnsupportedTask(format!("{:?}", t)).into()),
        }
    }

    fn get_task(&self) -> Vec<f32> {
        vec![]
    }

    fn max_episode_steps(&self) -> usize {
        self.len
    }

    fn elapsed_steps(&self) -> usize {
        self.t
    }

    fn observation_shape(&self) -> Vec<usize> {
        vec![1]
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Box {
            low: vec![-100.0],
            high: vec![100.0],
        }
    }
}

#[derive(Clone)]
struct EchoBuilder {
    lens: Vec<usize>,
}

impl EnvBuilder for EchoBuilder {
    type Env = Echo;

    fn build(&self, _seed: u64, rank: usize) -> Result<Echo> {
        Ok(Echo {
            len: self.lens[rank],
            t: 0,
            rank,
        })
    }
}

#[test_log::test]
fn test_ordering_matches_worker_index() -> Result<()> {
    let config = VecEnvConfig::default().num_processes(4).normalise_rew(false);
    let mut envs = make_vec_envs(EchoBuilder { lens: vec![10; 4] }, &config, None)?;
    let obs = envs.reset(None, None)?;
    assert_eq!(obs, vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]]);

    for t in 0..3 {
        let acts: Vec<Vec<f32>> = (0..4).map(|i| vec![(10 * i + t) as f32]).collect();
        let step = envs.step(acts.clone())?;
        assert_eq!(step.obs, acts);
        assert_eq!(step.rewards_raw, acts.iter().map(|a| a[0]).collect::<Vec<_>>());
        assert_eq!(step.rewards_normalised, step.rewards_raw);
    }
    Ok(())
}

#[test_log::test]
fn test_no_auto_reset_and_partial_reset() -> Result<()> {
    let config = VecEnvConfig::default().num_processes(3).normalise_rew(false);
    let mut envs = make_vec_envs(EchoBuilder { lens: vec![2, 1, 3] }, &config, None)?;
    envs.reset(None, None)?;

    let step = envs.step(vec![vec![0.0]; 3])?;
    assert_eq!(step.done(), vec![false, true, false]);
    assert_eq!(step.done_indices(), vec![1]);

    // worker 1 is stuck until it is reset
    assert!(envs.step(vec![vec![0.0]; 3]).is_err());

    let obs = envs.reset(Some(1), None)?;
    assert_eq!(obs, vec![vec![1.0]]);
    Ok(())
}

#[test_log::test]
fn test_panicking_worker_disconnects() -> Result<()> {
    let config = VecEnvConfig::default().num_processes(3).normalise_rew(false);
    let mut envs = make_vec_envs(EchoBuilder { lens: vec![10; 3] }, &config, None)?;
    envs.reset(None, None)?;
    envs.step(vec![vec![0.0]; 3])?;

    let err = envs
        .step(vec![vec![0.0], vec![PANIC_ACTION], vec![0.0]])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VaribadError>(),
        Some(VaribadError::WorkerDisconnected(1))
    ));
    Ok(())
}

#[test]
fn test_single_worker_runs_in_process() -> Result<()> {
    let config = VecEnvConfig::default().num_processes(1).normalise_rew(false);
    let mut envs = make_vec_envs(EchoBuilder { lens: vec![1] }, &config, None)?;
    assert_eq!(envs.num_envs(), 1);
    envs.reset(None, None)?;
    let step = envs.step(vec![vec![2.5]])?;
    assert_eq!(step.obs, vec![vec![2.5]]);
    assert!(step.done()[0]);
    Ok(())
}

#[test]
fn test_reward_normalisation() -> Result<()> {
    let config = VecEnvConfig::default()
        .num_processes(1)
        .normalise_rew(true)
        .gamma(0.5)
        .clip_reward(10.0);
    let mut envs = make_vec_envs(EchoBuilder { lens: vec![100] }, &config, None)?;
    envs.reset(None, None)?;

    // first step is normalised by the initial unit variance
    let step = envs.step(vec![vec![4.0]])?;
    assert!((step.rewards_normalised[0] - 4.0).abs() < 1e-4);
    assert_eq!(step.rewards_raw[0], 4.0);

    // the second uses the statistics of the first discounted return
    let rms = envs.ret_rms().unwrap().clone();
    let step = envs.step(vec![vec![1000.0]])?;
    let expected = (1000.0 / (rms.var[0] + 1e-8).sqrt()).clamp(-10.0, 10.0) as f32;
    assert!((step.rewards_normalised[0] - expected).abs() < 1e-4);
    assert_eq!(step.rewards_normalised[0], 10.0);
    Ok(())
}

#[test_log::test]
fn test_grid_navi_tasks_and_beliefs() -> Result<()> {
    let config = VecEnvConfig::default()
        .num_processes(2)
        .episodes_per_task(2);
    let mut envs = make_vec_envs(GridNaviBuilder::new(GridNaviConfig::default()), &config, None)?;
    let spec = envs.spec().clone();
    assert_eq!(spec.state_dim, 3);
    assert_eq!(spec.task_dim, 2);
    assert_eq!(spec.belief_dim, 25);
    assert_eq!(spec.horizon, 2 * 15 + 1);

    let tasks = vec![vec![3.0, 3.0], vec![4.0, 0.0]];
    let obs = envs.reset(None, Some(tasks.clone()))?;
    assert_eq!(obs, vec![vec![0.0, 0.0, 0.0]; 2]);
    assert_eq!(envs.get_task()?, tasks);

    let beliefs = envs.get_belief()?.unwrap();
    for b in beliefs.iter() {
        assert!((b.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
    Ok(())
}
