use crate::{encoder::RnnEncoder, storage::OnlineStorage};
use anyhow::Result;
use candle_core::Tensor;
use log::error;
use rand::rngs::SmallRng;
use varibad_core::error::VaribadError;

/// Sum of absolute differences above which recomputed latents are reported.
const MISMATCH_TOLERANCE: f32 = 1e-3;

/// Options of [`recompute_embeddings`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeOptions {
    /// Samples latents instead of using the means.
    pub sample: bool,

    /// Detaches the hidden state every `k` steps.
    pub detach_every: Option<usize>,

    /// Detaches the recomputed latents from the encoder.
    pub detach: bool,

    /// Returns an error if latents differ from the online ones at `update_idx == 0`.
    pub strict: bool,
}

fn abs_diff(a: &[Tensor], b: &[Tensor]) -> Result<f32> {
    let a = Tensor::stack(a, 0)?;
    let b = Tensor::stack(b, 0)?;
    Ok((a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?)
}

/// Re-encodes the rollout window in `storage` with the current encoder.
///
/// Starts from the first latent and hidden state of the window and replays the stored
/// transitions, resetting the hidden state where the BAMDP episode ended. The latent
/// lists of `storage` are replaced.
///
/// At `update_idx == 0` the encoder has not changed since the rollout, so the
/// recomputed means and log-variances must equal the online ones. A mismatch is logged.
/// It is returned as [`VaribadError::RecomputeMismatch`] if `options.strict` is set and
/// fails a debug assertion otherwise.
pub fn recompute_embeddings(
    storage: &mut OnlineStorage,
    encoder: &RnnEncoder,
    options: &RecomputeOptions,
    update_idx: usize,
    rng: &mut SmallRng,
) -> Result<()> {
    let t_max = storage.num_steps;
    if storage.latent_mean.len() != t_max + 1 {
        return Err(VaribadError::ConfigError(format!(
            "{} latents stored for a window of {} steps",
            storage.latent_mean.len(),
            t_max
        ))
        .into());
    }

    let mut samples = vec![storage.latent_samples[0].detach()];
    let mut means = vec![storage.latent_mean[0].detach()];
    let mut logvars = vec![storage.latent_logvar[0].detach()];
    let mut h = storage.hidden_states[0].detach();

    for i in 0..t_max {
        h = encoder.reset_hidden(&h, &storage.done[i + 1])?;
        if let Some(k) = options.detach_every {
            if k > 0 && i % k == 0 && i != 0 {
                h = h.detach();
            }
        }
        let latent = encoder.forward_step(
            &h,
            &storage.actions[i],
            &storage.next_state[i],
            &storage.rewards_raw[i],
            &storage.prev_state[i],
            options.sample,
            rng,
        )?;
        let latent = match options.detach {
            true => latent.detach(),
            false => latent,
        };
        h = latent.hidden;
        samples.push(latent.sample);
        means.push(latent.mean);
        logvars.push(latent.logvar);
    }

    if update_idx == 0 {
        let mean_diff = abs_diff(&means, &storage.latent_mean)?;
        let logvar_diff = abs_diff(&logvars, &storage.latent_logvar)?;
        if mean_diff > MISMATCH_TOLERANCE || logvar_diff > MISMATCH_TOLERANCE {
            error!(
                "Recomputed latents differ from online latents (mean: {}, logvar: {})",
                mean_diff, logvar_diff
            );
            if options.strict {
                return Err(VaribadError::RecomputeMismatch {
                    mean_diff,
                    logvar_diff,
                }
                .into());
            }
            debug_assert!(
                false,
                "recomputed latents differ from online latents (mean: {}, logvar: {})",
                mean_diff, logvar_diff
            );
        }
    }

    storage.latent_samples = samples;
    storage.latent_mean = means;
    storage.latent_logvar = logvars;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        encoder::EncoderConfig,
        storage::{OnlineStorageConfig, RolloutStep},
        util::{column_to_tensor, masks_from_flags},
    };
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use rand::SeedableRng;

    const N: usize = 3;
    const T: usize = 5;

    /// Fills a window the way the rollout loop does, with worker 1 finishing at step 2.
    fn rollout(encoder: &RnnEncoder, rng: &mut SmallRng) -> Result<OnlineStorage> {
        let dev = Device::Cpu;
        let config = OnlineStorageConfig {
            num_steps: T,
            num_processes: N,
            state_dim: 2,
            action_dim: 1,
            belief_dim: None,
            task_dim: None,
            hidden_size: encoder.hidden_size(),
            normalise_rewards: false,
        };
        let mut storage = OnlineStorage::new(&config, &dev)?;
        let prior = encoder.prior(N, true, rng)?;
        storage.push_prior(&prior)?;

        let mut h = prior.hidden;
        let mut state = Tensor::zeros((N, 2), DType::F32, &dev)?;
        for t in 0..T {
            let actions = column_to_tensor(&[t as f32, 1.0, 2.0], &dev)?;
            let next_state = ((&state + 0.25)? * (t as f64 + 1.0))?;
            let rewards = column_to_tensor(&[0.1 * t as f32, -0.1, 1.0], &dev)?;
            let done = vec![false, t == 2, false];
            h = encoder.reset_hidden(&h, &done)?;
            let latent = encoder
                .forward_step(&h, &actions, &next_state, &rewards, &state, true, rng)?
                .detach();
            h = latent.hidden.clone();
            storage.insert(RolloutStep {
                state: next_state.clone(),
                next_state: next_state.clone(),
                belief: None,
                task: None,
                actions,
                action_log_probs: Tensor::zeros((N, 1), DType::F32, &dev)?,
                rewards_raw: rewards.clone(),
                rewards_normalised: rewards,
                value_preds: Tensor::zeros((N, 1), DType::F32, &dev)?,
                masks: masks_from_flags(&done, &dev)?,
                bad_masks: Tensor::ones((N, 1), DType::F32, &dev)?,
                done,
                latent,
            })?;
            state = next_state;
        }
        Ok(storage)
    }

    fn encoder(varmap: &VarMap) -> Result<RnnEncoder> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let config = EncoderConfig::default()
            .state_dim(2)
            .action_dim(1)
            .hidden_size(8)
            .latent_dim(3);
        RnnEncoder::build(vb, config)
    }

    fn options(strict: bool) -> RecomputeOptions {
        RecomputeOptions {
            sample: false,
            detach_every: None,
            detach: true,
            strict,
        }
    }

    #[test]
    fn test_recompute_reproduces_online_latents() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let varmap = VarMap::new();
        let encoder = encoder(&varmap)?;
        let mut storage = rollout(&encoder, &mut rng)?;
        let online = Tensor::stack(&storage.latent_mean, 0)?;

        recompute_embeddings(&mut storage, &encoder, &options(true), 0, &mut rng)?;
        assert_eq!(storage.latent_mean.len(), T + 1);
        let recomputed = Tensor::stack(&storage.latent_mean, 0)?;
        let diff = (online - recomputed)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);

        // detaching the hidden state does not change forward values
        let mut opts = options(true);
        opts.detach_every = Some(2);
        recompute_embeddings(&mut storage, &encoder, &opts, 0, &mut rng)?;
        Ok(())
    }

    #[test]
    fn test_recompute_mismatch_is_reported() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let varmap = VarMap::new();
        let encoder = encoder(&varmap)?;
        let mut storage = rollout(&encoder, &mut rng)?;
        storage.latent_mean[3] = (&storage.latent_mean[3] + 1.0)?;

        let err = recompute_embeddings(&mut storage, &encoder, &options(true), 0, &mut rng)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VaribadError>(),
            Some(VaribadError::RecomputeMismatch { .. })
        ));

        // latents are only compared before the first parameter update
        recompute_embeddings(&mut storage, &encoder, &options(true), 1, &mut rng)?;
        Ok(())
    }
}
