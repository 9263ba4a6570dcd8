//! Proximal policy optimization of the actor-critic, optionally backpropagating the RL
//! loss into the encoder.
mod base;
mod config;
pub use base::{Ppo, UpdateContext};
pub use config::PpoConfig;
