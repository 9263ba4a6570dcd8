//! Recurrent task-inference encoder.
mod base;
mod config;
pub use base::{Latent, RnnEncoder, TrajectoryInput};
pub use config::EncoderConfig;
