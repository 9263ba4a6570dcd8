use super::BamdpConfig;
use crate::{error::VaribadError, Act, ActionSpace, EnvType, Info, MetaEnv};
use anyhow::Result;
use log::debug;

/// What happened at the end of a BAMDP step.
#[derive(Debug, Clone, PartialEq)]
pub enum Boundary {
    /// The inner episode continues.
    Continuing,

    /// An inner episode ended and the MDP was reset under the same task.
    ///
    /// `start_state` is the first observation of the next inner episode.
    /// `term_state` is the terminal observation of the finished episode and is
    /// recorded only for [`EnvType::Maze`] environments, for which the step itself
    /// already returns the start state.
    InnerBoundary {
        /// First observation of the next inner episode.
        start_state: Vec<f32>,

        /// Terminal observation of the finished inner episode.
        term_state: Option<Vec<f32>>,
    },

    /// The last inner episode of the task ended. The wrapper must be reset.
    FinalBoundary,
}

/// A step of the BAMDP.
#[derive(Debug, Clone)]
pub struct BamdpStep {
    /// Observation returned to the agent.
    pub obs: Vec<f32>,

    /// Reward.
    pub reward: f32,

    /// Information of the underlying MDP step.
    pub info: Info,

    /// Episode boundary.
    pub boundary: Boundary,
}

impl BamdpStep {
    /// Returns `true` if the BAMDP episode ended.
    pub fn is_done(&self) -> bool {
        self.boundary == Boundary::FinalBoundary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingFirstReset,
    Running,
    Done,
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Creates a multi-episode BAMDP around a one-episode MDP.
///
/// A BAMDP episode consists of `episodes_per_task` inner episodes under the same task.
/// Inner episodes except the last one are reset transparently inside [`step`]; only the
/// last one reports [`Boundary::FinalBoundary`], after which [`reset`] must be called.
///
/// ```mermaid
/// stateDiagram-v2
///     [*] --> AwaitingFirstReset
///     AwaitingFirstReset --> Running: reset
///     Running --> Running: step / Continuing
///     Running --> Running: step / InnerBoundary
///     Running --> Done: step / FinalBoundary
///     Done --> Running: reset
/// ```
///
/// If `episodes_per_task > 1`, a done flag is appended to observations:
/// `0.0` after a reset and the inner done flag of the MDP after each step.
///
/// [`step`]: BamdpWrapper::step
/// [`reset`]: BamdpWrapper::reset
pub struct BamdpWrapper<E: MetaEnv> {
    env: E,
    env_type: EnvType,
    episodes_per_task: usize,
    add_done_info: bool,
    episode_count: usize,
    step_count_bamdp: usize,
    horizon_bamdp: usize,
    phase: Phase,
}

impl<E: MetaEnv> BamdpWrapper<E> {
    /// Wraps an environment.
    ///
    /// Fails if the done flag has to be appended to observations with more than one axis.
    pub fn build(env: E, config: &BamdpConfig) -> Result<Self> {
        let episodes_per_task = config.episodes_per_task;
        if episodes_per_task == 0 {
            return Err(
                VaribadError::ConfigError("episodes_per_task must be positive".into()).into(),
            );
        }
        let add_done_info = episodes_per_task > 1;
        let shape = env.observation_shape();
        if add_done_info && shape.len() != 1 {
            return Err(VaribadError::UnsupportedObservationShape(shape).into());
        }

        // Inner resets occupy one extra transition each
        let horizon_bamdp =
            episodes_per_task * env.max_episode_steps() + (episodes_per_task - 1);

        Ok(Self {
            env_type: env.env_type(),
            env,
            episodes_per_task,
            add_done_info,
            episode_count: 0,
            step_count_bamdp: 0,
            horizon_bamdp,
            phase: Phase::AwaitingFirstReset,
        })
    }

    /// Resets the BAMDP with a new task.
    ///
    /// If the environment does not accept the given task specification,
    /// a task is sampled by the environment instead.
    pub fn reset(&mut self, task: Option<&[f32]>) -> Result<Vec<f32>> {
        if let Err(e) = self.env.reset_task(task) {
            match e.downcast_ref::<VaribadError>() {
                Some(VaribadError::UnsupportedTask(msg)) if task.is_some() => {
                    debug!("Falls back to sampling a task: {}", msg);
                    self.env.reset_task(None)?;
                }
                _ => return Err(e),
            }
        }

        let state = self.env.reset()?;
        self.episode_count = 0;
        self.step_count_bamdp = 0;
        self.phase = Phase::Running;

        Ok(self.with_done_flag(state, false))
    }

    /// Resets the underlying MDP only, not the task.
    pub fn reset_mdp(&mut self) -> Result<Vec<f32>> {
        let state = self.env.reset()?;
        Ok(self.with_done_flag(state, false))
    }

    /// Performs a step of the BAMDP.
    pub fn step(&mut self, act: &Act) -> Result<BamdpStep> {
        if self.phase != Phase::Running {
            return Err(VaribadError::NotReset.into());
        }

        let step = self.env.step(act)?;
        let done_mdp = step.done;
        let mut info = step.info;
        info.done_mdp = done_mdp;
        let mut obs = self.with_done_flag(step.obs, done_mdp);
        self.step_count_bamdp += 1;

        let boundary = if !done_mdp {
            Boundary::Continuing
        } else {
            self.episode_count += 1;
            if self.episode_count == self.episodes_per_task {
                self.phase = Phase::Done;
                Boundary::FinalBoundary
            } else {
                match self.env_type {
                    EnvType::Maze => {
                        let term_state = obs;
                        let mut start_state = self.reset_mdp()?;
                        if self.add_done_info {
                            if let Some(flag) = start_state.last_mut() {
                                *flag = 1.0;
                            }
                        }
                        obs = start_state.clone();
                        Boundary::InnerBoundary {
                            start_state,
                            term_state: Some(term_state),
                        }
                    }
                    EnvType::Gym => Boundary::InnerBoundary {
                        start_state: self.reset_mdp()?,
                        term_state: None,
                    },
                }
            }
        };

        Ok(BamdpStep {
            obs,
            reward: step.reward,
            info,
            boundary,
        })
    }

    fn with_done_flag(&self, mut state: Vec<f32>, done: bool) -> Vec<f32> {
        if self.add_done_info {
            state.push(if done { 1.0 } else { 0.0 });
        }
        state
    }

    /// Horizon of the BAMDP, including the transitions spent on inner resets.
    pub fn horizon(&self) -> usize {
        self.horizon_bamdp
    }

    /// The number of inner episodes finished since the last reset.
    pub fn episode_count(&self) -> usize {
        self.episode_count
    }

    /// The number of steps since the last reset.
    pub fn step_count(&self) -> usize {
        self.step_count_bamdp
    }

    /// The number of inner episodes per task.
    pub fn episodes_per_task(&self) -> usize {
        self.episodes_per_task
    }

    /// Dimension of the observations returned by the wrapper.
    pub fn state_dim(&self) -> usize {
        let dim: usize = self.env.observation_shape().iter().product();
        dim + self.add_done_info as usize
    }

    /// The current task.
    pub fn get_task(&self) -> Vec<f32> {
        self.env.get_task()
    }

    /// The ground-truth belief of the wrapped environment.
    pub fn get_belief(&self) -> Option<Vec<f32>> {
        self.env.get_belief()
    }

    /// Action space of the wrapped environment.
    pub fn action_space(&self) -> ActionSpace {
        self.env.action_space()
    }

    /// The wrapped environment.
    pub fn inner(&self) -> &E {
        &self.env
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::EnvStep;

    /// Counts down `len` steps per episode; observations are the step count.
    struct Countdown {
        len: usize,
        t: usize,
        env_type: EnvType,
        accept_task: bool,
        task: Vec<f32>,
    }

    impl Countdown {
        fn new(len: usize, env_type: EnvType) -> Self {
            Self {
                len,
                t: 0,
                env_type,
                accept_task: true,
                task: vec![0.0],
            }
        }
    }

    impl MetaEnv for Countdown {
        fn reset(&mut self) -> Result<Vec<f32>> {
            self.t = 0;
            Ok(vec![0.0])
        }

        fn step(&mut self, _act: &[f32]) -> Result<EnvStep> {
            self.t += 1;
            Ok(EnvStep::new(
                vec![self.t as f32],
                1.0,
                self.t >= self.len,
                Info::default(),
            ))
        }

        fn reset_task(&mut self, task: Option<&[f32]>) -> Result<Vec<f32>> {
            match task {
                Some(_) if !self.accept_task => {
                    Err(VaribadError::UnsupportedTask("countdown".into()).into())
                }
                Some(t) => {
                    self.task = t.to_vec();
                    Ok(self.task.clone())
                }
                None => {
                    self.task = vec![-1.0];
                    Ok(self.task.clone())
                }
            }
        }

        fn get_task(&self) -> Vec<f32> {
            self.task.clone()
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
            ActionSpace::Discrete(1)
        }

        fn env_type(&self) -> EnvType {
            self.env_type
        }
    }

    #[test]
    fn test_boundary_counting() -> Result<()> {
        for k in 1..=4 {
            let config = BamdpConfig::default().episodes_per_task(k);
            let mut env = BamdpWrapper::build(Countdown::new(3, EnvType::Gym), &config)?;
            assert_eq!(env.horizon(), k * 3 + k - 1);
            env.reset(None)?;

            let mut inner = 0;
            let mut steps = 0;
            loop {
                let step = env.step(&vec![0.0])?;
                steps += 1;
                match step.boundary {
                    Boundary::Continuing => {}
                    Boundary::InnerBoundary { .. } => inner += 1,
                    Boundary::FinalBoundary => break,
                }
            }
            assert_eq!(inner, k - 1);
            assert_eq!(env.episode_count(), k);
            assert_eq!(steps, 3 * k);

            // no auto-reset after the final boundary
            assert!(env.step(&vec![0.0]).is_err());
        }
        Ok(())
    }

    #[test]
    fn test_done_flag() -> Result<()> {
        let config = BamdpConfig::default().episodes_per_task(2);
        let mut env = BamdpWrapper::build(Countdown::new(2, EnvType::Gym), &config)?;
        assert_eq!(env.reset(None)?, vec![0.0, 0.0]);
        assert_eq!(env.state_dim(), 2);

        let s1 = env.step(&vec![0.0])?;
        assert_eq!(s1.obs, vec![1.0, 0.0]);
        let s2 = env.step(&vec![0.0])?;
        assert_eq!(s2.obs, vec![2.0, 1.0]);
        assert!(s2.info.done_mdp);
        assert_eq!(
            s2.boundary,
            Boundary::InnerBoundary {
                start_state: vec![0.0, 0.0],
                term_state: None
            }
        );
        Ok(())
    }

    #[test]
    fn test_maze_boundary() -> Result<()> {
        let config = BamdpConfig::default().episodes_per_task(2);
        let mut env = BamdpWrapper::build(Countdown::new(1, EnvType::Maze), &config)?;
        env.reset(None)?;

        let s = env.step(&vec![0.0])?;
        assert_eq!(s.obs, vec![0.0, 1.0]);
        assert_eq!(
            s.boundary,
            Boundary::InnerBoundary {
                start_state: vec![0.0, 1.0],
                term_state: Some(vec![1.0, 1.0])
            }
        );
        Ok(())
    }

    #[test]
    fn test_task_fallback() -> Result<()> {
        let mut countdown = Countdown::new(1, EnvType::Gym);
        countdown.accept_task = false;
        let mut env = BamdpWrapper::build(countdown, &BamdpConfig::default())?;
        env.reset(Some(&[3.0]))?;
        assert_eq!(env.get_task(), vec![-1.0]);
        Ok(())
    }

    #[test]
    fn test_step_before_reset() -> Result<()> {
        let mut env = BamdpWrapper::build(Countdown::new(1, EnvType::Gym), &BamdpConfig::default())?;
        assert!(env.step(&vec![0.0]).is_err());
        Ok(())
    }
}
