// Engine configuration
// Similarity thresholds and batching limits, tunable per deployment

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Configuration for identity resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Similarity at or above which a match is safe for automatic linking
    /// during a library scan (0.0 to 1.0).
    pub strong_threshold: f32,
    /// Similarity at or above which a match is surfaced to a human but
    /// never auto-applied. Must be below `strong_threshold`.
    pub weak_threshold: f32,
    /// Minimum number of human-approved segments for recalibration.
    pub min_training_samples: usize,
    /// Cap on segments used when building a reference vector.
    pub max_training_segments: usize,
    /// Cap on concurrent calls to the embedding gateway.
    pub max_concurrent_extractions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strong_threshold: 0.8,
            weak_threshold: 0.5,
            min_training_samples: 3,
            max_training_segments: 10,
            max_concurrent_extractions: 4,
        }
    }
}

impl EngineConfig {
    /// Validate threshold ordering and limits.
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.weak_threshold > 0.0
            && self.weak_threshold < self.strong_threshold
            && self.strong_threshold < 1.0)
        {
            return Err(EngineError::InvalidArgument(format!(
                "thresholds must satisfy 0 < weak < strong < 1, got weak={} strong={}",
                self.weak_threshold, self.strong_threshold
            )));
        }
        if self.min_training_samples == 0 {
            return Err(EngineError::InvalidArgument(
                "min_training_samples must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_extractions == 0 {
            return Err(EngineError::InvalidArgument(
                "max_concurrent_extractions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
