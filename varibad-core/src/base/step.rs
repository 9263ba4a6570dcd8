//! Environment step.

/// Additional information emitted by an environment step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Info {
    /// The inner episode ended because the step limit was reached.
    pub bad_transition: bool,

    /// The inner MDP episode ended at this step.
    pub done_mdp: bool,

    /// The current task, if the environment reports it.
    pub task: Option<Vec<f32>>,

    /// The ground-truth belief, if the environment maintains one.
    pub belief: Option<Vec<f32>>,
}

/// Observation, reward and done flag of a single (non-vectorized) environment step.
#[derive(Debug, Clone)]
pub struct EnvStep {
    /// Observation after the transition.
    pub obs: Vec<f32>,

    /// Reward.
    pub reward: f32,

    /// Flag denoting if the episode ended.
    pub done: bool,

    /// Additional information.
    pub info: Info,
}

impl EnvStep {
    /// Constructs an [`EnvStep`] object.
    pub fn new(obs: Vec<f32>, reward: f32, done: bool, info: Info) -> Self {
        Self {
            obs,
            reward,
            done,
            info,
        }
    }
}
