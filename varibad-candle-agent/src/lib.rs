//! VariBAD meta-learner implemented with [candle](https://crates.io/crates/candle-core).
//!
//! The crate provides the learned components of the system, i.e., the recurrent
//! [`encoder`] inferring a latent task embedding, the optional [`decoder`]s and the
//! [`vae`] loss, the actor-critic [`policy`] trained with [`ppo`], the two rollout
//! buffers in [`storage`], and the training loop in [`metalearner`].
pub mod decoder;
pub mod encoder;
pub mod metalearner;
pub mod mlp;
pub mod model;
pub mod opt;
pub mod policy;
pub mod ppo;
pub mod storage;
pub mod util;
pub mod vae;
pub use mlp::Activation;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq)]
/// Device for using candle.
///
/// This enum is added because [`candle_core::Device`] does not support serialization.
pub enum Device {
    /// The main CPU device.
    Cpu,

    /// The main GPU device.
    Cuda(usize),
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl TryFrom<Device> for candle_core::Device {
    type Error = candle_core::Error;

    fn try_from(device: Device) -> Result<Self, Self::Error> {
        match device {
            Device::Cpu => Ok(candle_core::Device::Cpu),
            Device::Cuda(n) => candle_core::Device::new_cuda(n),
        }
    }
}
