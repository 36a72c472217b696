// Embedding gateway
// Narrow boundary around the external embedding-extraction model. The
// engine treats it as a black box: recording + time range in, vector out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// A time range within a recording, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Whether this range fully covers `[start, end]`, with a small
    /// tolerance for floating-point timestamps.
    pub fn covers(&self, start: f64, end: f64) -> bool {
        const EPS: f64 = 1e-6;
        self.start <= start + EPS && end <= self.end + EPS
    }
}

/// What audio to embed.
#[derive(Debug, Clone)]
pub enum ExtractionRequest {
    /// Everything the diarizer attributed to a label in the recording.
    Label(String),
    /// An explicit set of time ranges.
    Ranges(Vec<TimeRange>),
}

/// External embedding-extraction model. Implementations wrap whatever
/// actually produces voiceprints (local model, sidecar process, remote
/// service); calls may be slow and should be treated as async I/O.
///
/// Failures surface as [`crate::EngineError::ExtractionFailed`].
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn extract(
        &self,
        recording_id: i64,
        request: ExtractionRequest,
    ) -> EngineResult<Vec<f32>>;
}
