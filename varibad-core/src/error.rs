//! Errors in the library.
use thiserror::Error;

/// Errors raised by the environment layer and the components built on it.
#[derive(Error, Debug)]
pub enum VaribadError {
    /// Record key error.
    #[error("Record key error: {0}")]
    RecordKeyError(String),

    /// Record value type error.
    #[error("Record value type error: {0}")]
    RecordValueTypeError(String),

    /// The environment can not take the given task specification.
    #[error("Unsupported task: {0}")]
    UnsupportedTask(String),

    /// The done flag can only be appended to 1-dimensional observations.
    #[error("Unsupported observation shape: {0:?}")]
    UnsupportedObservationShape(Vec<usize>),

    /// Unsupported action space.
    #[error("Unsupported action space: {0}")]
    UnsupportedActionSpace(String),

    /// Invalid combination of configuration values.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A worker of a vectorized environment hung up.
    #[error("Worker {0} disconnected")]
    WorkerDisconnected(usize),

    /// The environment was stepped before being reset.
    #[error("Environment must be reset before stepping")]
    NotReset,

    /// Latents recomputed with unchanged parameters differ from the online ones.
    #[error("Recomputed latents differ from online latents (mean: {mean_diff}, logvar: {logvar_diff})")]
    RecomputeMismatch {
        /// Sum of absolute differences of the latent means.
        mean_diff: f32,

        /// Sum of absolute differences of the latent log-variances.
        logvar_diff: f32,
    },
}
