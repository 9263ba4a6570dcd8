use super::Record;

/// Writes a record to an output destination with [`Recorder::write`].
///
/// Implementations typically pick one of the step counters in the record
/// (`"iter_idx"` or `"frames"`) as the x-axis of the scalar time series.
pub trait Recorder {
    /// Write a record to the [`Recorder`].
    fn write(&mut self, record: Record);
}
