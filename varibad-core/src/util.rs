//! Utilities.
use log::info;
use rand::{rngs::SmallRng, SeedableRng};

/// Creates the random number generator of a training run.
///
/// All randomness is derived from the returned generator or from seeds passed
/// explicitly to environments, so runs with a single worker are reproducible.
pub fn seed(seed: u64, num_processes: usize) -> SmallRng {
    info!("Seeding the random number generator with {}", seed);
    if num_processes > 1 {
        info!(
            "Results with {} workers are similar but not identical across runs. \
             Use a single worker for identical results.",
            num_processes
        );
    }
    SmallRng::seed_from_u64(seed)
}
