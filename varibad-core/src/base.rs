//! Core interface of environments.
mod env;
mod space;
mod step;
pub use env::{Act, EnvBuilder, EnvType, MetaEnv};
pub use space::ActionSpace;
pub use step::{EnvStep, Info};
