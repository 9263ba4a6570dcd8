//! Rollout buffers.
//!
//! [`OnlineStorage`] holds one rollout window of `num_steps x num_processes` steps used
//! for policy updates and is reused across windows. [`VaeStorage`] holds the full
//! per-task trajectories used to train and re-encode the encoder.
mod online;
mod trajectory;
pub use online::{MiniBatch, OnlineStorage, OnlineStorageConfig, RolloutStep};
pub use trajectory::{TrajectoryBatch, VaeStorage};
