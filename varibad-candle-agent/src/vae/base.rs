use super::VaeConfig;
use crate::{
    decoder::{DecoderConfig, DecoderInput, RewardDecoder, StateTransitionDecoder, TaskDecoder},
    encoder::{Latent, RnnEncoder},
    model::SubModel1,
    opt::Optimizer,
    storage::{TrajectoryBatch, VaeStorage},
    util::{param_stats, scalar_tensor},
};
use anyhow::Result;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use rand::rngs::SmallRng;
use std::path::Path;
use varibad_core::{
    error::VaribadError,
    record::{Record, RecordValue},
};

fn build_decoder<M>(config: &DecoderConfig, device: &Device) -> Result<(VarMap, M)>
where
    M: SubModel1<Config = DecoderConfig>,
{
    let varmap = VarMap::new();
    let model = {
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        M::build(vb, config.clone())?
    };
    Ok((varmap, model))
}

/// Masks of valid ELBO terms `[elbo, batch]` and of valid reconstructions
/// `[elbo, timestep, batch]`.
///
/// The ELBO term `t` is the latent after `t` transitions, valid for `t <= len`. Each
/// valid term reconstructs all valid transitions of its trajectory.
fn elbo_masks(lens: &[usize], seq_len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let (num_elbos, batch_size) = (seq_len + 1, lens.len());
    let flag = |b: bool| if b { 1f32 } else { 0f32 };

    let mut elbo = Vec::with_capacity(num_elbos * batch_size);
    let mut dec = Vec::with_capacity(num_elbos * seq_len * batch_size);
    for t in 0..num_elbos {
        for &len in lens.iter() {
            elbo.push(flag(t <= len));
        }
        for j in 0..seq_len {
            for &len in lens.iter() {
                dec.push(flag(t <= len && j < len));
            }
        }
    }

    Ok((
        Tensor::from_vec(elbo, (num_elbos, batch_size), device)?,
        Tensor::from_vec(dec, (num_elbos, seq_len, batch_size), device)?,
    ))
}

/// Squared error summed over the last dimension.
fn sq_err(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok((pred - target)?.sqr()?.sum(D::Minus1)?)
}

/// VariBAD encoder and decoders trained with the ELBO.
pub struct VaribadVae {
    config: VaeConfig,
    device: Device,
    encoder_varmap: VarMap,
    encoder: RnnEncoder,
    reward_decoder: Option<(VarMap, RewardDecoder)>,
    state_decoder: Option<(VarMap, StateTransitionDecoder)>,
    task_decoder: Option<(VarMap, TaskDecoder)>,
    opt: Optimizer,
    storage: VaeStorage,
}

impl VaribadVae {
    /// Constructs [`VaribadVae`] with an empty trajectory storage for `num_processes`
    /// workers.
    pub fn build(
        config: VaeConfig,
        num_processes: usize,
        max_trajectory_len: usize,
        device: &Device,
    ) -> Result<Self> {
        let enc = &config.encoder;
        let dec = &config.decoder;
        if enc.latent_dim != dec.latent_dim
            || enc.state_dim != dec.state_dim
            || enc.action_dim != dec.action_dim
        {
            return Err(VaribadError::ConfigError(format!(
                "encoder (latent {}, state {}, action {}) and decoders (latent {}, state {}, action {}) do not match",
                enc.latent_dim, enc.state_dim, enc.action_dim,
                dec.latent_dim, dec.state_dim, dec.action_dim
            ))
            .into());
        }
        if config.decode_task && dec.task_dim == 0 {
            return Err(VaribadError::ConfigError(
                "task decoder requires a positive task dimension".into(),
            )
            .into());
        }

        let encoder_varmap = VarMap::new();
        let encoder = {
            let vb = VarBuilder::from_varmap(&encoder_varmap, DType::F32, device);
            RnnEncoder::build(vb, enc.clone())?
        };
        let reward_decoder = match config.decode_reward {
            true => Some(build_decoder(dec, device)?),
            false => None,
        };
        let state_decoder = match config.decode_state {
            true => Some(build_decoder(dec, device)?),
            false => None,
        };
        let task_decoder = match config.decode_task {
            true => Some(build_decoder(dec, device)?),
            false => None,
        };

        let mut vars = encoder_varmap.all_vars();
        for varmap in [
            reward_decoder.as_ref().map(|d| &d.0),
            state_decoder.as_ref().map(|d| &d.0),
            task_decoder.as_ref().map(|d| &d.0),
        ]
        .iter()
        .flatten()
        {
            vars.extend(varmap.all_vars());
        }
        let opt = config.opt_config.build(vars)?;

        let storage = VaeStorage::new(
            num_processes,
            config.vae_buffer_size,
            enc.state_dim,
            enc.action_dim,
            dec.task_dim,
        )
        .max_trajectory_len(max_trajectory_len);

        Ok(Self {
            config,
            device: device.clone(),
            encoder_varmap,
            encoder,
            reward_decoder,
            state_decoder,
            task_decoder,
            opt,
            storage,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    /// The encoder.
    pub fn encoder(&self) -> &RnnEncoder {
        &self.encoder
    }

    /// Variables of the encoder.
    pub fn encoder_vars(&self) -> Vec<Var> {
        self.encoder_varmap.all_vars()
    }

    /// Trajectory storage.
    pub fn storage(&self) -> &VaeStorage {
        &self.storage
    }

    /// Mutable reference to the trajectory storage.
    pub fn storage_mut(&mut self) -> &mut VaeStorage {
        &mut self.storage
    }

    /// Updates the encoder and decoders with precomputed gradients.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.opt.step(grads)
    }

    /// Computes the VAE loss on trajectories sampled from the storage.
    ///
    /// If `update` is `true`, the encoder and decoders take one optimizer step. The loss
    /// is zero and the record empty as long as no trajectory has been completed.
    pub fn compute_vae_loss(&mut self, update: bool, rng: &mut SmallRng) -> Result<(Tensor, Record)> {
        let batch = self
            .storage
            .sample_batch(self.config.vae_batch_num_trajs, rng, &self.device)?;
        let batch = match batch {
            Some(batch) => batch,
            None => return Ok((scalar_tensor(0.0, &self.device)?, Record::empty())),
        };

        let (loss, record) = self.elbo_loss(&batch, rng)?;
        if update {
            self.opt.backward_step(&loss)?;
        }
        Ok((loss, record))
    }

    fn elbo_loss(&self, batch: &TrajectoryBatch, rng: &mut SmallRng) -> Result<(Tensor, Record)> {
        let input = &batch.input;
        let (seq_len, batch_size) = (input.seq_len(), input.batch_size());
        let num_elbos = seq_len + 1;
        let sample = !self.config.disable_stochasticity_in_latent;

        let latent = self
            .encoder
            .forward_sequence(input, None, true, sample, None, None, rng)?;
        let (mask_elbo, mask_dec) = elbo_masks(&batch.lens, seq_len, &self.device)?;
        let n = batch_size as f64;

        let kl = ((self.kl_divergence(&latent)? * &mask_elbo)?.sum_all()? / n)?;
        let mut loss = (&kl * self.config.kl_weight)?;
        let mut record = Record::from_scalar("vae_losses/kl", kl.to_scalar::<f32>()?);

        let latents = match sample {
            true => &latent.sample,
            false => &latent.mean,
        };
        let latent_dim = latents.dims()[2];
        let per_transition = |x: &Tensor| -> Result<Tensor> {
            let dim = x.dims()[2];
            Ok(x.unsqueeze(0)?
                .broadcast_as((num_elbos, seq_len, batch_size, dim))?
                .contiguous()?)
        };

        if self.reward_decoder.is_some() || self.state_decoder.is_some() {
            let dec_input = DecoderInput {
                latent: latents
                    .unsqueeze(1)?
                    .broadcast_as((num_elbos, seq_len, batch_size, latent_dim))?
                    .contiguous()?,
                prev_state: per_transition(&input.prev_states)?,
                action: per_transition(&input.actions)?,
                next_state: per_transition(&input.next_states)?,
            };

            if let Some((_, decoder)) = &self.reward_decoder {
                let pred = decoder.forward(&dec_input)?;
                let err = sq_err(&pred, &per_transition(&input.rewards)?)?;
                let rew_loss = ((err * &mask_dec)?.sum_all()? / n)?;
                record.insert(
                    "vae_losses/reward_reconstr_err",
                    RecordValue::Scalar(rew_loss.to_scalar::<f32>()?),
                );
                loss = (loss + (rew_loss * self.config.rew_loss_coeff)?)?;
            }

            if let Some((_, decoder)) = &self.state_decoder {
                let pred = decoder.forward(&dec_input)?;
                let err = sq_err(&pred, &dec_input.next_state)?;
                let state_loss = ((err * &mask_dec)?.sum_all()? / n)?;
                record.insert(
                    "vae_losses/state_reconstr_err",
                    RecordValue::Scalar(state_loss.to_scalar::<f32>()?),
                );
                loss = (loss + (state_loss * self.config.state_loss_coeff)?)?;
            }
        }

        if let Some((_, decoder)) = &self.task_decoder {
            let tasks = batch.tasks.as_ref().ok_or_else(|| {
                VaribadError::ConfigError("task decoder requires stored tasks".into())
            })?;
            let task_dim = tasks.dims()[1];
            let target = tasks
                .unsqueeze(0)?
                .broadcast_as((num_elbos, batch_size, task_dim))?;
            let err = sq_err(&decoder.forward(latents)?, &target)?;
            let task_loss = ((err * &mask_elbo)?.sum_all()? / n)?;
            record.insert(
                "vae_losses/task_reconstr_err",
                RecordValue::Scalar(task_loss.to_scalar::<f32>()?),
            );
            loss = (loss + (task_loss * self.config.task_loss_coeff)?)?;
        }

        record.insert("vae_losses/sum", RecordValue::Scalar(loss.to_scalar::<f32>()?));
        Ok((loss, record))
    }

    /// `KL(q_t || q_{t-1})` of each ELBO term, `[elbo, batch]`.
    ///
    /// The first posterior, and with `kl_to_gauss_prior` every posterior, is compared
    /// with `N(0, I)`.
    fn kl_divergence(&self, latent: &Latent) -> Result<Tensor> {
        let (mean, logvar) = (&latent.mean, &latent.logvar);
        let (num_elbos, batch_size, dim) = mean.dims3()?;

        let (prior_mean, prior_logvar) = match self.config.kl_to_gauss_prior {
            true => (mean.zeros_like()?, logvar.zeros_like()?),
            false => {
                let zeros = Tensor::zeros((1, batch_size, dim), DType::F32, mean.device())?;
                (
                    Tensor::cat(&[&zeros, &mean.narrow(0, 0, num_elbos - 1)?], 0)?,
                    Tensor::cat(&[&zeros, &logvar.narrow(0, 0, num_elbos - 1)?], 0)?,
                )
            }
        };

        let var_ratio = ((logvar.exp()? + (mean - &prior_mean)?.sqr()?)? / prior_logvar.exp()?)?;
        let kl = (((&prior_logvar - logvar)? - 1.0)? + var_ratio)?;
        Ok((kl.sum(D::Minus1)? * 0.5)?)
    }

    /// Mean parameter values of the encoder and decoders.
    pub fn param_stats(&self) -> Result<Record> {
        let mut record = param_stats(&self.encoder_varmap, "encoder")?;
        if let Some((varmap, _)) = &self.reward_decoder {
            record.merge_inplace(param_stats(varmap, "reward_decoder")?);
        }
        if let Some((varmap, _)) = &self.state_decoder {
            record.merge_inplace(param_stats(varmap, "state_decoder")?);
        }
        if let Some((varmap, _)) = &self.task_decoder {
            record.merge_inplace(param_stats(varmap, "task_decoder")?);
        }
        Ok(record)
    }

    fn varmaps(&self) -> Vec<(&'static str, &VarMap)> {
        let mut varmaps = vec![("encoder", &self.encoder_varmap)];
        if let Some((varmap, _)) = &self.reward_decoder {
            varmaps.push(("reward_decoder", varmap));
        }
        if let Some((varmap, _)) = &self.state_decoder {
            varmaps.push(("state_decoder", varmap));
        }
        if let Some((varmap, _)) = &self.task_decoder {
            varmaps.push(("task_decoder", varmap));
        }
        varmaps
    }

    /// Saves the encoder and the decoders as `{name}{label}.safetensors` in `dir`.
    pub fn save(&self, dir: impl AsRef<Path>, label: &str) -> Result<()> {
        for (name, varmap) in self.varmaps() {
            let path = dir.as_ref().join(format!("{}{}.safetensors", name, label));
            varmap.save(&path)?;
            info!("Save {} to {:?}", name, path);
        }
        Ok(())
    }

    /// Loads the encoder and the decoders saved with [`VaribadVae::save`].
    pub fn load(&mut self, dir: impl AsRef<Path>, label: &str) -> Result<()> {
        let mut varmaps = vec![("encoder", &mut self.encoder_varmap)];
        if let Some((varmap, _)) = self.reward_decoder.as_mut() {
            varmaps.push(("reward_decoder", varmap));
        }
        if let Some((varmap, _)) = self.state_decoder.as_mut() {
            varmaps.push(("state_decoder", varmap));
        }
        if let Some((varmap, _)) = self.task_decoder.as_mut() {
            varmaps.push(("task_decoder", varmap));
        }
        for (name, varmap) in varmaps {
            let path = dir.as_ref().join(format!("{}{}.safetensors", name, label));
            varmap.load(&path)?;
            info!("Load {} from {:?}", name, path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoder::EncoderConfig;
    use rand::SeedableRng;
    use tempdir::TempDir;

    fn config() -> VaeConfig {
        VaeConfig::default()
            .encoder(
                EncoderConfig::default()
                    .state_dim(2)
                    .action_dim(1)
                    .hidden_size(8)
                    .latent_dim(3),
            )
            .decoder(
                DecoderConfig::default()
                    .latent_dim(3)
                    .dims(2, 1, 2)
                    .reward_layers(vec![8])
                    .state_layers(vec![8])
                    .task_layers(vec![8]),
            )
            .decode(true, true, true)
            .vae_batch_num_trajs(4)
    }

    fn fill(vae: &mut VaribadVae, num_trajectories: usize) -> Result<()> {
        let states = vec![vec![0.5, 0.0]];
        let tasks = vec![vec![1.0, 2.0]];
        for k in 0..num_trajectories {
            let len = 2 + k % 3;
            for t in 0..len {
                vae.storage_mut().insert(
                    &states,
                    &[vec![t as f32]],
                    &states,
                    &[if t + 1 == len { 1.0 } else { -0.1 }],
                    &[t + 1 == len],
                    Some(tasks.as_slice()),
                )?;
            }
        }
        Ok(())
    }

    #[test]
    fn test_mismatched_dims_are_rejected() {
        let config = config().decoder(DecoderConfig::default().latent_dim(4).dims(2, 1, 2));
        assert!(VaribadVae::build(config, 1, 10, &Device::Cpu).is_err());
    }

    #[test]
    fn test_vae_loss_is_zero_without_trajectories() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut vae = VaribadVae::build(config(), 1, 10, &Device::Cpu)?;
        let (loss, record) = vae.compute_vae_loss(true, &mut rng)?;
        assert_eq!(loss.to_scalar::<f32>()?, 0.0);
        assert!(record.is_empty());
        Ok(())
    }

    #[test]
    fn test_vae_update() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut vae = VaribadVae::build(config(), 1, 10, &Device::Cpu)?;
        fill(&mut vae, 6)?;
        assert_eq!(vae.storage().len(), 6);

        let before = vae.param_stats()?.get_scalar("weights/encoder")?;
        let (loss, record) = vae.compute_vae_loss(true, &mut rng)?;
        let after = vae.param_stats()?.get_scalar("weights/encoder")?;
        assert!(loss.to_scalar::<f32>()?.is_finite());
        assert!(record.get_scalar("vae_losses/kl")? >= -1e-5);
        assert!(record.get_scalar("vae_losses/reward_reconstr_err")? > 0.0);
        assert!(record.get_scalar("vae_losses/state_reconstr_err")? >= 0.0);
        assert!(record.get_scalar("vae_losses/task_reconstr_err")? >= 0.0);
        assert_ne!(before, after);
        Ok(())
    }

    #[test]
    fn test_elbo_masks() -> Result<()> {
        let (elbo, dec) = elbo_masks(&[1, 2], 2, &Device::Cpu)?;
        assert_eq!(
            elbo.to_vec2::<f32>()?,
            vec![vec![1.0, 1.0], vec![1.0, 1.0], vec![0.0, 1.0]]
        );
        // elbo 2 of the first trajectory is padding
        let dec = dec.to_vec3::<f32>()?;
        assert_eq!(dec[0], vec![vec![1.0, 1.0], vec![0.0, 1.0]]);
        assert_eq!(dec[2], vec![vec![0.0, 1.0], vec![0.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let tmp = TempDir::new("vae")?;
        let mut rng = SmallRng::seed_from_u64(0);
        let vae = VaribadVae::build(config(), 1, 10, &Device::Cpu)?;
        vae.save(tmp.path(), "")?;
        assert!(tmp.path().join("encoder.safetensors").exists());
        assert!(tmp.path().join("task_decoder.safetensors").exists());

        let mut other = VaribadVae::build(config(), 1, 10, &Device::Cpu)?;
        other.load(tmp.path(), "")?;
        let a = vae.encoder().prior(1, false, &mut rng)?.mean.to_vec2::<f32>()?;
        let b = other.encoder().prior(1, false, &mut rng)?.mean.to_vec2::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }
}
