use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`BamdpWrapper`](super::BamdpWrapper).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct BamdpConfig {
    /// The number of inner episodes under the same task.
    pub episodes_per_task: usize,
}

impl Default for BamdpConfig {
    fn default() -> Self {
        Self {
            episodes_per_task: 1,
        }
    }
}

impl BamdpConfig {
    /// Sets the number of inner episodes per task.
    pub fn episodes_per_task(mut self, v: usize) -> Self {
        self.episodes_per_task = v;
        self
    }

    /// Constructs [`BamdpConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`BamdpConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
