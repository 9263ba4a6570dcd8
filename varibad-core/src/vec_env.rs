//! Vectorized environments.
//!
//! [`make_vec_envs`] runs `num_processes` environments, each wrapped in
//! [`TimeLimitMask`] and [`BamdpWrapper`]. A single environment runs in the calling
//! thread ([`DummyVecEnv`]); more than one runs in worker threads ([`SubprocVecEnv`]).
//! The result is decorated with [`VecNormalize`].
//!
//! Workers finishing their BAMDP episode are not reset automatically; the caller
//! resets them with [`VecEnv::reset`] and an index.
mod base;
mod config;
mod dummy;
mod messages;
mod normalize;
mod running_mean_std;
mod subproc;
use crate::{BamdpConfig, BamdpWrapper, EnvBuilder, TimeLimitMask};
use anyhow::Result;
pub use base::{EnvSpec, VecEnv, VecStep};
pub use config::VecEnvConfig;
pub use dummy::DummyVecEnv;
pub use normalize::VecNormalize;
pub use running_mean_std::RunningMeanStd;
pub use subproc::SubprocVecEnv;

/// Environment run by a worker of a vectorized environment.
pub type WorkerEnv<E> = BamdpWrapper<TimeLimitMask<E>>;

/// Builds the environment of the worker with index `rank`.
pub fn make_worker_env<B: EnvBuilder>(
    builder: &B,
    seed: u64,
    rank: usize,
    config: &BamdpConfig,
) -> Result<WorkerEnv<B::Env>> {
    let env = builder.build(seed, rank)?;
    BamdpWrapper::build(TimeLimitMask::new(env), config)
}

/// Builds a vectorized environment.
///
/// `ret_rms` gives initial statistics for reward normalisation, e.g., those of
/// the training environments when building environments for evaluation.
pub fn make_vec_envs<B: EnvBuilder>(
    builder: B,
    config: &VecEnvConfig,
    ret_rms: Option<RunningMeanStd>,
) -> Result<VecNormalize<Box<dyn VecEnv>>> {
    config.check()?;
    let bamdp_config = BamdpConfig::default().episodes_per_task(config.episodes_per_task);
    let venv: Box<dyn VecEnv> = if config.num_processes > 1 {
        Box::new(SubprocVecEnv::build(
            builder,
            config.num_processes,
            config.seed,
            &bamdp_config,
        )?)
    } else {
        Box::new(DummyVecEnv::build(&builder, 1, config.seed, &bamdp_config)?)
    };

    Ok(VecNormalize::new(
        venv,
        config.normalise_rew,
        config.gamma,
        config.clip_reward,
        ret_rms,
    ))
}
