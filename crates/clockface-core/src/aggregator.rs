//! Signature aggregation: N enrollment samples → one representative descriptor.
//!
//! The signature is the component-wise centroid of the accepted samples.
//! No weighting or outlier rejection is applied; bad captures are expected
//! to be discarded by the operator before submission.

use crate::types::{CapturedSample, FaceDescriptor};
use thiserror::Error;

/// Minimum number of samples required to compute a signature.
pub const DEFAULT_MIN_SAMPLES: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("at least {required} samples are required, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },
}

/// Component-wise mean aggregator.
#[derive(Debug, Clone, Copy)]
pub struct CentroidAggregator {
    min_samples: usize,
}

impl Default for CentroidAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SAMPLES)
    }
}

impl CentroidAggregator {
    pub fn new(min_samples: usize) -> Self {
        Self { min_samples }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Compute the centroid of `samples`.
    ///
    /// Each dimension is summed in sorted order (f64 accumulator), so the
    /// result is bit-identical for any permutation of the input.
    pub fn aggregate(&self, samples: &[CapturedSample]) -> Result<FaceDescriptor, AggregateError> {
        // An empty set never yields a signature, even with min_samples = 0.
        let required = self.min_samples.max(1);
        if samples.len() < required {
            return Err(AggregateError::InsufficientSamples {
                required,
                actual: samples.len(),
            });
        }

        let dim = samples[0].descriptor.len();
        debug_assert!(
            samples.iter().all(|s| s.descriptor.len() == dim),
            "descriptor dimensionality mismatch within one enrollment"
        );

        let count = samples.len() as f64;
        let mut column = Vec::with_capacity(samples.len());
        let values = (0..dim)
            .map(|i| {
                column.clear();
                column.extend(samples.iter().map(|s| s.descriptor.values()[i]));
                column.sort_by(|a, b| a.total_cmp(b));
                let sum: f64 = column.iter().map(|&v| f64::from(v)).sum();
                (sum / count) as f32
            })
            .collect();

        tracing::debug!(samples = samples.len(), dim, "aggregated signature");
        Ok(FaceDescriptor::new(values))
    }
}
