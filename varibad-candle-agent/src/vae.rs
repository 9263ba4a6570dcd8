//! Variational auto-encoder inferring latent task embeddings.
//!
//! [`VaribadVae`] owns the [`RnnEncoder`](crate::encoder::RnnEncoder), the optional
//! decoders, their optimizer and the [`VaeStorage`](crate::storage::VaeStorage) of
//! trajectories used to train them.
mod base;
mod config;
pub use base::VaribadVae;
pub use config::VaeConfig;
