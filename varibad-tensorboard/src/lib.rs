//! TensorBoard recorder for training logs.
use log::warn;
use std::path::Path;
use tensorboard_rs::summary_writer::SummaryWriter;
use varibad_core::record::{Record, RecordValue, Recorder};

/// Writes records to TFRecord.
///
/// Scalars are written against the step stored in the record under the step key,
/// `"iter_idx"` by default. Arrays are written element-wise as `{key}/{index}`.
pub struct TensorboardRecorder {
    writer: SummaryWriter,
    step_key: String,
}

impl TensorboardRecorder {
    /// Constructs a [`TensorboardRecorder`].
    ///
    /// TFRecord will be stored in `logdir`.
    pub fn new<P: AsRef<Path>>(logdir: P) -> Self {
        Self {
            writer: SummaryWriter::new(logdir),
            step_key: "iter_idx".to_string(),
        }
    }

    /// Sets the key of the step, e.g., `"frames"`.
    pub fn step_key(mut self, key: impl Into<String>) -> Self {
        self.step_key = key.into();
        self
    }

    /// Flushes pending events to disk.
    pub fn flush(&mut self) {
        self.writer.flush();
    }
}

impl Recorder for TensorboardRecorder {
    /// Writes a given [`Record`] into a TFRecord.
    ///
    /// Records without the step key are dropped.
    fn write(&mut self, record: Record) {
        let step = match record.get(&self.step_key) {
            Some(RecordValue::Scalar(v)) => *v as usize,
            _ => {
                warn!("Record without step key {:?} is dropped", self.step_key);
                return;
            }
        };

        for (k, v) in record.iter() {
            if *k == self.step_key {
                continue;
            }
            match v {
                RecordValue::Scalar(v) => self.writer.add_scalar(k, *v, step),
                RecordValue::Array1(vs) => {
                    for (i, v) in vs.iter().enumerate() {
                        self.writer.add_scalar(&format!("{}/{}", k, i), *v, step);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_write_records() {
        let dir = TempDir::new("tensorboard").unwrap();
        let mut recorder = TensorboardRecorder::new(dir.path());
        for i in 0..3 {
            let mut record = Record::from_scalar("iter_idx", i as f32);
            record.insert("policy_losses/value_loss", RecordValue::Scalar(0.5));
            record.insert("encoder/latent_mean", RecordValue::Array1(vec![0.1, 0.2]));
            recorder.write(record);
        }
        recorder.write(Record::from_scalar("no_step", 1.0));
        recorder.flush();

        let n_files = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(n_files > 0);
    }
}
