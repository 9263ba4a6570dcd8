//! Training loop of VariBAD.
//!
//! [`MetaLearner`] collects rollout windows with the vectorized environments, encoding
//! each transition online, and updates the policy with PPO and the VAE on trajectories
//! of completed tasks. [`recompute_embeddings`] replays a rollout window through the
//! current encoder before each policy update.
mod base;
mod config;
mod eval;
mod recompute;
pub use base::{MetaLearner, VisualiseHook};
pub use config::MetaLearnerConfig;
pub use eval::EvalResult;
pub use recompute::{recompute_embeddings, RecomputeOptions};
