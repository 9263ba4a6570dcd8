//! Utilities.
use crate::opt::Optimizer;
use anyhow::Result;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::VarMap;
use rand::{rngs::SmallRng, Rng};
use rand_distr::StandardNormal;
use varibad_core::record::{Record, RecordValue};

/// Samples from the standard normal distribution.
pub fn randn(shape: &[usize], device: &Device, rng: &mut SmallRng) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Reparameterised sample `mu + exp(0.5 * logvar) * eps`.
pub fn sample_gaussian(mu: &Tensor, logvar: &Tensor, rng: &mut SmallRng) -> Result<Tensor> {
    let std = (logvar * 0.5)?.exp()?;
    let eps = randn(std.dims(), std.device(), rng)?;
    Ok((mu + (std * eps)?)?)
}

/// Builds the latent fed to the policy.
///
/// With `add_nonlinearity`, ReLU is applied to all three tensors first. The sample is
/// used if `sample_embeddings`, otherwise mean and log-variance are concatenated.
pub fn get_latent_for_policy(
    sample_embeddings: bool,
    add_nonlinearity: bool,
    latent_sample: &Tensor,
    latent_mean: &Tensor,
    latent_logvar: &Tensor,
) -> Result<Tensor> {
    let (sample, mean, logvar) = match add_nonlinearity {
        true => (
            latent_sample.relu()?,
            latent_mean.relu()?,
            latent_logvar.relu()?,
        ),
        false => (
            latent_sample.clone(),
            latent_mean.clone(),
            latent_logvar.clone(),
        ),
    };

    match sample_embeddings {
        true => Ok(sample),
        false => Ok(Tensor::cat(&[mean, logvar], D::Minus1)?),
    }
}

/// Decreases the learning rate linearly and returns the new value.
pub fn update_linear_schedule(
    opt: &mut Optimizer,
    epoch: usize,
    total_num_epochs: usize,
    initial_lr: f64,
) -> f64 {
    let lr = initial_lr - (initial_lr * (epoch as f64 / total_num_epochs as f64));
    opt.set_learning_rate(lr);
    lr
}

/// Element-wise smooth L1 (Huber) loss.
pub fn smooth_l1(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let d = (x - y)?.abs()?;
    let m1 = d.lt(1.0)?.to_dtype(DType::F32)?;
    let m2 = (1.0 - &m1)?;
    Ok((((0.5 * m1)? * d.sqr()?)? + (m2 * (d - 0.5)?)?)?)
}

/// Smooth L1 loss averaged over all elements.
pub fn smooth_l1_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    Ok(smooth_l1(x, y)?.mean_all()?)
}

/// Rescales the gradients of `vars` so that their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f32> {
    let mut sq_sum = 0f32;
    for var in vars.iter() {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq_sum += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let norm = sq_sum.sqrt();

    let coef = max_norm / (norm as f64 + 1e-6);
    if coef < 1.0 {
        for var in vars.iter() {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (g * coef)?);
            }
        }
    }

    Ok(norm)
}

/// Mean of the parameter means of a model, recorded as `weights/{name}`.
pub fn param_stats(varmap: &VarMap, name: &str) -> Result<Record> {
    let vars = varmap.all_vars();
    let mut sum = 0f32;
    for v in vars.iter() {
        sum += v.mean_all()?.to_scalar::<f32>()?;
    }
    let mean = match vars.len() {
        0 => 0.0,
        n => sum / n as f32,
    };

    Ok(Record::from_slice(&[(
        format!("weights/{}", name),
        RecordValue::Scalar(mean),
    )]))
}

/// Stacks row vectors into a `[rows, dim]` tensor.
pub fn rows_to_tensor(rows: &[Vec<f32>], dim: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Ok(Tensor::from_vec(data, (rows.len(), dim), device)?)
}

/// Column tensor `[n, 1]` from values.
pub fn column_to_tensor(values: &[f32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(values, (values.len(), 1), device)?)
}

/// `[n, 1]` tensor of `1.0` where `flags` is `false` and `0.0` otherwise.
pub fn masks_from_flags(flags: &[bool], device: &Device) -> Result<Tensor> {
    let masks: Vec<f32> = flags.iter().map(|&f| if f { 0.0 } else { 1.0 }).collect();
    column_to_tensor(&masks, device)
}

/// Mean over all elements as a scalar.
pub fn mean_scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?)
}

/// Converts a scalar into a tensor on the given device.
pub fn scalar_tensor(v: f32, device: &Device) -> Result<Tensor> {
    Ok(Tensor::new(v, device)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_randn_moments() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let t = randn(&[1000, 3], &Device::Cpu, &mut rng)?;
        assert_eq!(t.dims(), [1000, 3]);
        let mean = mean_scalar(&t)?;
        let var = mean_scalar(&t.sqr()?)?;
        assert!(mean.abs() < 0.1);
        assert!((var - 1.0).abs() < 0.1);

        // odd sizes and reproducible from the seed
        let a = randn(&[3, 5], &Device::Cpu, &mut SmallRng::seed_from_u64(7))?;
        let b = randn(&[3, 5], &Device::Cpu, &mut SmallRng::seed_from_u64(7))?;
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_latent_for_policy() -> Result<()> {
        let dev = Device::Cpu;
        let sample = Tensor::from_slice(&[-1f32, 2.0], (1, 2), &dev)?;
        let mean = Tensor::from_slice(&[0.5f32, -0.5], (1, 2), &dev)?;
        let logvar = Tensor::from_slice(&[-2f32, 3.0], (1, 2), &dev)?;

        let latent = get_latent_for_policy(true, false, &sample, &mean, &logvar)?;
        assert_eq!(latent.to_vec2::<f32>()?, vec![vec![-1.0, 2.0]]);

        let latent = get_latent_for_policy(false, false, &sample, &mean, &logvar)?;
        assert_eq!(latent.to_vec2::<f32>()?, vec![vec![0.5, -0.5, -2.0, 3.0]]);

        let latent = get_latent_for_policy(false, true, &sample, &mean, &logvar)?;
        assert_eq!(latent.to_vec2::<f32>()?, vec![vec![0.5, 0.0, 0.0, 3.0]]);
        Ok(())
    }

    #[test]
    fn test_linear_schedule() -> Result<()> {
        let var = Var::zeros(1, DType::F32, &Device::Cpu)?;
        let mut opt = crate::opt::OptimizerConfig::default()
            .learning_rate(1.0)
            .build(vec![var])?;
        assert_eq!(update_linear_schedule(&mut opt, 0, 4, 1.0), 1.0);
        assert_eq!(update_linear_schedule(&mut opt, 3, 4, 1.0), 0.25);
        assert_eq!(opt.learning_rate(), 0.25);
        Ok(())
    }

    #[test]
    fn test_clip_grad_norm() -> Result<()> {
        let var = Var::from_slice(&[3f32, 4.0], 2, &Device::Cpu)?;
        let loss = (var.as_tensor().sqr()? * 0.5)?.sum_all()?;
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&[var.clone()], &mut grads, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5);
        let g: Vec<f32> = grads.get(var.as_tensor()).unwrap().to_vec1()?;
        assert!((g[0] - 0.6).abs() < 1e-4);
        assert!((g[1] - 0.8).abs() < 1e-4);
        Ok(())
    }
}
