// Database models - Transcript segments

use serde::{Deserialize, Serialize};

/// An immutable utterance owned by the recording's transcript. The engine
/// only reads segments to build training sets and split selections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub recording_id: i64,
    pub diarization_label: String,
    /// Start time in seconds.
    pub start_time: f64,
    /// End time in seconds, always greater than start_time.
    pub end_time: f64,
    pub text: String,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}
