use super::EnvSpec;
use crate::{Act, BamdpStep};

/// Commands sent to a worker.
pub(super) enum Command {
    /// Reset the BAMDP with an optional task.
    Reset(Option<Vec<f32>>),

    /// Reset the inner MDP only.
    ResetMdp,

    /// Step the environment.
    Step(Act),

    /// Send the current task.
    GetTask,

    /// Send the ground-truth belief.
    GetBelief,

    /// Finish the worker loop.
    Close,
}

/// Replies of a worker.
pub(super) enum Response {
    /// Specification of the environment, sent once after construction.
    Spec(EnvSpec),

    /// Observation after a reset.
    Obs(Vec<f32>),

    /// Result of a step.
    Step(BamdpStep),

    /// Current task.
    Task(Vec<f32>),

    /// Ground-truth belief.
    Belief(Option<Vec<f32>>),
}
