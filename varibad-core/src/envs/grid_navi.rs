//! Grid navigation with an unknown goal.
use crate::{error::VaribadError, ActionSpace, EnvBuilder, EnvStep, Info, MetaEnv};
use anyhow::Result;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Action index that asks for a hint on the goal.
const HINT_ACTION: usize = 5;

/// Configuration of [`GridNavi`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct GridNaviConfig {
    /// The number of cells along each axis.
    pub num_cells: usize,

    /// Step limit of an episode.
    pub num_steps: usize,

    /// Start cell. If `None`, episodes start at a random possible goal.
    pub starting_state: Option<(usize, usize)>,

    /// Reward for visiting a possible goal for the first time under the current task.
    pub new_state_reward: Option<f32>,

    /// If `true`, the reward off the goal is the negative Manhattan distance
    /// to the goal divided by `num_cells`.
    pub distance_reward: bool,
}

impl Default for GridNaviConfig {
    fn default() -> Self {
        Self {
            num_cells: 5,
            num_steps: 15,
            starting_state: Some((0, 0)),
            new_state_reward: None,
            distance_reward: false,
        }
    }
}

impl GridNaviConfig {
    /// Sets the number of cells along each axis.
    pub fn num_cells(mut self, v: usize) -> Self {
        self.num_cells = v;
        self
    }

    /// Sets the step limit of an episode.
    pub fn num_steps(mut self, v: usize) -> Self {
        self.num_steps = v;
        self
    }

    /// Sets the start cell.
    pub fn starting_state(mut self, v: Option<(usize, usize)>) -> Self {
        self.starting_state = v;
        self
    }

    /// Sets the reward for visiting an unchecked possible goal.
    pub fn new_state_reward(mut self, v: Option<f32>) -> Self {
        self.new_state_reward = v;
        self
    }

    /// Enables the distance-based reward.
    pub fn distance_reward(mut self, v: bool) -> Self {
        self.distance_reward = v;
        self
    }

    /// Constructs [`GridNaviConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`GridNaviConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// A grid world where the goal cell is the task.
///
/// The agent starts at `starting_state` and moves with actions
/// `0: noop, 1: up (y + 1), 2: right (x + 1), 3: down, 4: left`. Goals can be anywhere
/// except the 3x3 neighbourhood of the start. Reaching the goal gives `1.0`, any other
/// step `-0.1` unless one of the optional rewards is configured.
///
/// The environment maintains a ground-truth belief over goal cells, indexed by
/// [`GridNavi::task_to_id`]. Stepping on a cell that is not the goal removes it from
/// the belief. Stepping on the goal (or taking the hint action) collapses the belief onto
/// the true goal and one uniformly chosen wrong goal, with mass 0.5 each.
pub struct GridNavi {
    num_cells: usize,
    max_steps: usize,
    step_count: usize,
    starting_state: Option<(usize, usize)>,
    new_state_reward: Option<f32>,
    distance_reward: bool,
    possible_goals: Vec<(usize, usize)>,
    goals_unchecked: HashSet<(usize, usize)>,
    state: (usize, usize),
    goal: (usize, usize),
    belief: Vec<f32>,
    rng: SmallRng,
}

impl GridNavi {
    /// Builds the environment with a random seed.
    pub fn build(config: &GridNaviConfig, seed: u64) -> Result<Self> {
        let n = config.num_cells;
        if n < 2 {
            return Err(VaribadError::ConfigError(format!("num_cells = {} is too small", n)).into());
        }

        let possible_goals: Vec<(usize, usize)> = {
            let all = (0..n).flat_map(|x| (0..n).map(move |y| (x, y)));
            match config.starting_state {
                Some((sx, sy)) => all
                    .filter(|&(x, y)| {
                        (x as i64 - sx as i64).abs() > 1 || (y as i64 - sy as i64).abs() > 1
                    })
                    .collect(),
                None => all.collect(),
            }
        };
        if possible_goals.len() < 2 {
            return Err(VaribadError::ConfigError("grid has fewer than 2 possible goals".into()).into());
        }

        let mut rng = SmallRng::seed_from_u64(seed);
        let state = match config.starting_state {
            Some(s) => s,
            None => possible_goals[rng.gen_range(0..possible_goals.len())],
        };
        let goal = possible_goals[rng.gen_range(0..possible_goals.len())];

        let mut env = Self {
            num_cells: n,
            max_steps: config.num_steps,
            step_count: 0,
            starting_state: config.starting_state,
            new_state_reward: config.new_state_reward,
            distance_reward: config.distance_reward,
            goals_unchecked: possible_goals.iter().cloned().collect(),
            possible_goals,
            state,
            goal,
            belief: vec![0.0; n * n],
            rng,
        };
        env.reset_belief();

        Ok(env)
    }

    /// Index of a cell in the belief vector.
    pub fn task_to_id(&self, cell: (usize, usize)) -> usize {
        cell.0 * self.num_cells + cell.1
    }

    /// Cell of an index in the belief vector.
    pub fn id_to_task(&self, id: usize) -> (usize, usize) {
        (id / self.num_cells, id % self.num_cells)
    }

    /// Possible goal cells.
    pub fn possible_goals(&self) -> &[(usize, usize)] {
        &self.possible_goals
    }

    /// The current cell of the agent.
    pub fn position(&self) -> (usize, usize) {
        self.state
    }

    fn reset_belief(&mut self) {
        let p = 1.0 / self.possible_goals.len() as f32;
        self.belief.iter_mut().for_each(|b| *b = 0.0);
        for i in 0..self.possible_goals.len() {
            let id = self.task_to_id(self.possible_goals[i]);
            self.belief[id] = p;
        }
    }

    fn update_belief(&mut self, action: usize) {
        let on_goal = self.state == self.goal;

        if action == HINT_ACTION || on_goal {
            let wrong_goals: Vec<_> = self
                .possible_goals
                .iter()
                .filter(|&&g| g != self.goal)
                .cloned()
                .collect();
            let wrong_hint = wrong_goals[self.rng.gen_range(0..wrong_goals.len())];
            self.belief.iter_mut().for_each(|b| *b = 0.0);
            let (i_goal, i_wrong) = (self.task_to_id(self.goal), self.task_to_id(wrong_hint));
            self.belief[i_goal] = 0.5;
            self.belief[i_wrong] = 0.5;
        } else {
            let i = self.task_to_id(self.state);
            self.belief[i] = 0.0;
            self.belief.iter_mut().for_each(|b| *b = b.ceil());
            let sum: f32 = self.belief.iter().sum();
            self.belief.iter_mut().for_each(|b| *b /= sum);
        }
    }

    fn state_transition(&mut self, action: usize) {
        let last = self.num_cells - 1;
        let (x, y) = self.state;
        self.state = match action {
            1 => (x, (y + 1).min(last)),
            2 => ((x + 1).min(last), y),
            3 => (x, y.saturating_sub(1)),
            4 => (x.saturating_sub(1), y),
            _ => (x, y),
        };
    }

    fn obs(&self) -> Vec<f32> {
        vec![self.state.0 as f32, self.state.1 as f32]
    }
}

impl MetaEnv for GridNavi {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.step_count = 0;
        self.state = match self.starting_state {
            Some(s) => s,
            None => self.possible_goals[self.rng.gen_range(0..self.possible_goals.len())],
        };
        Ok(self.obs())
    }

    fn step(&mut self, act: &[f32]) -> Result<EnvStep> {
        if !self.action_space().contains(act) {
            return Err(VaribadError::UnsupportedActionSpace(format!(
                "invalid action {:?} for GridNavi",
                act
            ))
            .into());
        }
        let action = act[0] as usize;

        self.state_transition(action);
        let checked_potential_goal = self.goals_unchecked.remove(&self.state);

        self.step_count += 1;
        let done = self.step_count >= self.max_steps;

        let reward = match self.new_state_reward {
            _ if self.state == self.goal => 1.0,
            Some(r) if checked_potential_goal => r,
            _ if self.distance_reward => {
                let dx = (self.state.0 as f32 - self.goal.0 as f32).abs();
                let dy = (self.state.1 as f32 - self.goal.1 as f32).abs();
                -(dx + dy) / self.num_cells as f32
            }
            _ => -0.1,
        };

        self.update_belief(action);

        let info = Info {
            task: Some(self.get_task()),
            belief: Some(self.belief.clone()),
            ..Info::default()
        };

        Ok(EnvStep::new(self.obs(), reward, done, info))
    }

    fn reset_task(&mut self, task: Option<&[f32]>) -> Result<Vec<f32>> {
        self.goal = match task {
            None => self.possible_goals[self.rng.gen_range(0..self.possible_goals.len())],
            Some(t) => {
                let cell = match t {
                    [x, y] if *x >= 0.0 && *y >= 0.0 => (*x as usize, *y as usize),
                    _ => return Err(VaribadError::UnsupportedTask(format!("{:?}", t)).into()),
                };
                // goals next to the start would empty the belief
                if !self.possible_goals.contains(&cell) {
                    return Err(VaribadError::UnsupportedTask(format!("{:?}", t)).into());
                }
                cell
            }
        };
        self.reset_belief();
        self.goals_unchecked = self.possible_goals.iter().cloned().collect();
        Ok(self.get_task())
    }

    fn get_task(&self) -> Vec<f32> {
        vec![self.goal.0 as f32, self.goal.1 as f32]
    }

    fn get_belief(&self) -> Option<Vec<f32>> {
        Some(self.belief.clone())
    }

    fn task_dim(&self) -> usize {
        2
    }

    fn belief_dim(&self) -> usize {
        self.num_cells * self.num_cells
    }

    fn num_states(&self) -> Option<usize> {
        Some(self.num_cells * self.num_cells)
    }

    fn max_episode_steps(&self) -> usize {
        self.max_steps
    }

    fn elapsed_steps(&self) -> usize {
        self.step_count
    }

    fn observation_shape(&self) -> Vec<usize> {
        vec![2]
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(5)
    }
}

/// Builds [`GridNavi`] for the workers of a vectorized environment.
#[derive(Debug, Clone, Default)]
pub struct GridNaviBuilder {
    config: GridNaviConfig,
}

impl GridNaviBuilder {
    /// Constructs a builder.
    pub fn new(config: GridNaviConfig) -> Self {
        Self { config }
    }
}

impl EnvBuilder for GridNaviBuilder {
    type Env = GridNavi;

    fn build(&self, seed: u64, rank: usize) -> Result<GridNavi> {
        GridNavi::build(&self.config, seed + rank as u64)
    }
}
