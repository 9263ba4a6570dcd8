//! Records of training metrics and the recorders consuming them.
//!
//! The meta-learner collects scalar time series (losses, gradient norms, evaluation
//! returns) into a [`Record`] and hands it to a [`Recorder`]. Each record carries its
//! own step counters (`"iter_idx"` and `"frames"`), so a recorder decides which axis
//! to use when writing.
//!
//! ```rust
//! use varibad_core::record::{Record, RecordValue};
//!
//! let mut record = Record::from_scalar("iter_idx", 10.0);
//! record.insert("policy_losses/value_loss", RecordValue::Scalar(0.25));
//! assert_eq!(record.get_scalar("policy_losses/value_loss").unwrap(), 0.25);
//! ```
mod base;
mod buffered_recorder;
mod null_recorder;
mod recorder;

pub use base::{Record, RecordValue};
pub use buffered_recorder::BufferedRecorder;
pub use null_recorder::NullRecorder;
pub use recorder::Recorder;
