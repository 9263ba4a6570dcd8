//! Actor-critic policy conditioned on states, beliefs, tasks and latent embeddings.
mod base;
mod config;
pub use base::{ActorCritic, PolicyInput};
pub use config::PolicyConfig;
