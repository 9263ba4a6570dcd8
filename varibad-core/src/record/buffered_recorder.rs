use super::{Record, Recorder};

/// Keeps records in memory.
#[derive(Default)]
pub struct BufferedRecorder(Vec<Record>);

impl BufferedRecorder {
    /// Construct the recorder.
    pub fn new() -> Self {
        Self(Vec::default())
    }

    /// Returns an iterator over the records.
    pub fn iter(&self) -> std::slice::Iter<Record> {
        self.0.iter()
    }

    /// The number of records written so far.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no record has been written.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collects the values of a scalar key over all records containing it.
    pub fn scalars(&self, key: &str) -> Vec<f32> {
        self.0
            .iter()
            .filter_map(|r| r.get_scalar(key).ok())
            .collect()
    }
}

impl Recorder for BufferedRecorder {
    /// Write a [`Record`] to the buffer.
    fn write(&mut self, record: Record) {
        self.0.push(record);
    }
}
