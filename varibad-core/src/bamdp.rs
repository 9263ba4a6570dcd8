//! Wrapper turning a single-episode MDP into a multi-episode BAMDP.
mod base;
mod config;
pub use base::{BamdpStep, BamdpWrapper, Boundary};
pub use config::BamdpConfig;
