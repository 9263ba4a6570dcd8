use serde::{Deserialize, Serialize};

/// Action space of an environment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ActionSpace {
    /// `n` discrete actions, encoded as a single float index.
    Discrete(usize),

    /// Bounded continuous actions.
    Box {
        /// Lower bounds.
        low: Vec<f32>,

        /// Upper bounds.
        high: Vec<f32>,
    },
}

impl ActionSpace {
    /// The length of an action vector.
    ///
    /// Discrete actions are stored as a single float.
    pub fn action_dim(&self) -> usize {
        match self {
            Self::Discrete(_) => 1,
            Self::Box { low, .. } => low.len(),
        }
    }

    /// Returns `true` if the action space is discrete.
    pub fn is_discrete(&self) -> bool {
        matches!(self, Self::Discrete(_))
    }

    /// Checks if an action is in the space.
    pub fn contains(&self, act: &[f32]) -> bool {
        match self {
            Self::Discrete(n) => {
                act.len() == 1 && act[0] >= 0.0 && act[0].fract() == 0.0 && (act[0] as usize) < *n
            }
            Self::Box { low, high } => {
                act.len() == low.len()
                    && act
                        .iter()
                        .zip(low.iter().zip(high.iter()))
                        .all(|(a, (l, h))| l <= a && a <= h)
            }
        }
    }
}
