//! Decoders reconstructing rewards, state transitions and tasks from latent embeddings.
//!
//! All decoders are deterministic and trained with the squared error. Inputs may carry
//! any number of leading batch dimensions, e.g., `[elbo, timestep, batch, dim]`.
mod base;
mod config;
pub use base::{DecoderInput, RewardDecoder, StateTransitionDecoder, TaskDecoder};
pub use config::DecoderConfig;
