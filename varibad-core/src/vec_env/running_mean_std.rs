use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Running mean and variance of a stream of vectors.
///
/// Statistics of a new batch are merged with the parallel algorithm of Chan et al.
/// <https://en.wikipedia.org/wiki/Algorithms_for_calculating_variance#Parallel_algorithm>
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunningMeanStd {
    /// Running mean.
    pub mean: Vec<f64>,

    /// Running (population) variance.
    pub var: Vec<f64>,

    /// The number of samples seen, starting from a small pseudo-count.
    pub count: f64,
}

impl RunningMeanStd {
    /// Initial statistics for vectors of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self::with_epsilon(dim, 1e-4)
    }

    /// Initial statistics with a given pseudo-count.
    pub fn with_epsilon(dim: usize, epsilon: f64) -> Self {
        Self {
            mean: vec![0.0; dim],
            var: vec![1.0; dim],
            count: epsilon,
        }
    }

    /// Updates the statistics with a batch of vectors.
    pub fn update(&mut self, batch: &[Vec<f64>]) {
        if batch.is_empty() {
            return;
        }
        let n = batch.len() as f64;
        let dim = self.mean.len();
        let mut batch_mean = vec![0.0; dim];
        let mut batch_var = vec![0.0; dim];
        for x in batch.iter() {
            for (m, v) in batch_mean.iter_mut().zip(x.iter()) {
                *m += v / n;
            }
        }
        for x in batch.iter() {
            for ((s, v), m) in batch_var.iter_mut().zip(x.iter()).zip(batch_mean.iter()) {
                *s += (v - m).powi(2) / n;
            }
        }
        self.update_from_moments(&batch_mean, &batch_var, n);
    }

    /// Merges the moments of a batch into the statistics.
    pub fn update_from_moments(&mut self, batch_mean: &[f64], batch_var: &[f64], batch_count: f64) {
        let tot_count = self.count + batch_count;
        for i in 0..self.mean.len() {
            let delta = batch_mean[i] - self.mean[i];
            let m_a = self.var[i] * self.count;
            let m_b = batch_var[i] * batch_count;
            let m2 = m_a + m_b + delta.powi(2) * self.count * batch_count / tot_count;
            self.mean[i] += delta * batch_count / tot_count;
            self.var[i] = m2 / tot_count;
        }
        self.count = tot_count;
    }

    /// Loads statistics from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        Ok(serde_json::from_reader(rdr)?)
    }

    /// Saves statistics as a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_json::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_matches_batch_statistics() {
        let xs: Vec<f64> = (0..100).map(|i| (i as f64 * 0.37).sin() * 3.0 + 1.0).collect();
        let mut rms = RunningMeanStd::with_epsilon(1, 0.0);
        for chunk in xs.chunks(7) {
            let batch: Vec<Vec<f64>> = chunk.iter().map(|&x| vec![x]).collect();
            rms.update(&batch);
        }

        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        assert!((rms.mean[0] - mean).abs() < 1e-9);
        assert!((rms.var[0] - var).abs() < 1e-9);
        assert_eq!(rms.count, n);
    }

    #[test]
    fn test_save_load() -> Result<()> {
        let mut rms = RunningMeanStd::new(2);
        rms.update(&[vec![1.0, 2.0], vec![3.0, 5.0]]);
        let dir = TempDir::new("running_mean_std")?;
        let path = dir.path().join("env_rew_rms.json");
        rms.save(&path)?;
        assert_eq!(rms, RunningMeanStd::load(&path)?);

        // values that need all 17 significant digits
        let mut rms = RunningMeanStd::new(1);
        for x in [1.0, 3.0, 2.0, 7.5, -0.3].iter() {
            rms.update(&[vec![*x]]);
        }
        rms.save(&path)?;
        let loaded = RunningMeanStd::load(&path)?;
        assert_eq!(rms.mean[0].to_bits(), loaded.mean[0].to_bits());
        assert_eq!(rms.var[0].to_bits(), loaded.var[0].to_bits());
        assert_eq!(rms.count.to_bits(), loaded.count.to_bits());
        Ok(())
    }
}
