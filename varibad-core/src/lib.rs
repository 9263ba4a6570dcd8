#![warn(missing_docs)]
//! Environment layer of a meta reinforcement learning library.
//!
//! A task-dependent, single-episode MDP implementing [`MetaEnv`] is wrapped in
//! [`TimeLimitMask`] and [`BamdpWrapper`] to form a multi-episode BAMDP, and several
//! of them are run in parallel with the vectorized environments in [`vec_env`].
pub mod bamdp;
pub mod envs;
pub mod error;
pub mod record;
mod time_limit;
pub mod util;
pub mod vec_env;

mod base;
pub use base::{Act, ActionSpace, EnvBuilder, EnvStep, EnvType, Info, MetaEnv};
pub use bamdp::{BamdpConfig, BamdpStep, BamdpWrapper, Boundary};
pub use time_limit::TimeLimitMask;
