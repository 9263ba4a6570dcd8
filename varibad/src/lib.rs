//! Meta reinforcement learning with variational task inference in Rust.
//!
//! The library consists of the following crates:
//!
//! * [varibad-core](https://crates.io/crates/varibad-core) defines the environment
//!   interface, wraps single-episode environments into multi-episode BAMDPs, runs them
//!   in parallel worker threads, and normalises rewards. It also includes the GridNavi
//!   toy environment and records for logging.
//! * [varibad-candle-agent](https://crates.io/crates/varibad-candle-agent) implements
//!   the recurrent encoder, the decoders, the actor-critic policy and PPO on
//!   [candle](https://crates.io/crates/candle-core), and the training loop
//!   `MetaLearner`.
//! * [varibad-tensorboard](https://crates.io/crates/varibad-tensorboard) has
//!   `TensorboardRecorder` to write records which can be shown in Tensorboard.
//!
//! This crate re-exports them and hosts the GridNavi trainer in `examples/grid_navi.rs`.
pub use varibad_candle_agent as agent;
pub use varibad_core as env;
pub use varibad_tensorboard as tensorboard;

pub use varibad_candle_agent::metalearner::{MetaLearner, MetaLearnerConfig};
pub use varibad_core::envs::{GridNaviBuilder, GridNaviConfig};
pub use varibad_tensorboard::TensorboardRecorder;
