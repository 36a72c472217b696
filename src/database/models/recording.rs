// Database models - Recording
use serde::{Deserialize, Serialize};

/// A recording entry. The engine only needs an anchor for recording-scoped
/// rows; audio storage and transcription live elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: i64,
    pub title: String,
    pub created_at: String,
}
