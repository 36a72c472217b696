// Database models - Speakers
// Global identities and the per-recording rows that reference them

use serde::{Deserialize, Serialize};

/// A persistent cross-recording speaker identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSpeaker {
    pub id: i64,
    pub name: String,
    /// Reference voice embedding. None until the first extraction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Set by recalibration; a locked vector is never overwritten by
    /// automatic scans or ordinary links.
    pub locked: bool,
    /// Optimistic-lock counter, bumped by every embedding-affecting write.
    pub version: i64,
    /// Number of distinct recordings referencing this identity (derived).
    pub recording_count: i64,
    pub created_at: String,
}

impl GlobalSpeaker {
    /// A dangling identity is referenced by nothing and safe to prune.
    pub fn is_dangling(&self) -> bool {
        self.recording_count == 0
    }
}

/// A recording-local speaker row: one diarization label within one
/// recording, optionally linked to a global identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSpeaker {
    pub id: i64,
    pub recording_id: i64,
    /// Diarizer-assigned label, e.g. "SPEAKER_00". Unique per recording,
    /// immutable.
    pub diarization_label: String,
    /// The link. None = unresolved or local-only.
    pub global_speaker_id: Option<i64>,
    /// Local display-name override (used for local-only speakers).
    pub display_name: Option<String>,
    /// Embedding snapshot captured at extraction time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: String,
}

/// Where a recording speaker sits in the resolution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    /// No embedding extracted, no link.
    Unresolved,
    /// Embedding snapshot exists but no decision applied yet.
    Extracted,
    /// Named for this recording only; excluded from cross-recording
    /// matching until promoted.
    LocalOnly,
    /// Linked to a global identity.
    Linked,
}

impl RecordingSpeaker {
    pub fn resolution_state(&self) -> ResolutionState {
        match (self.global_speaker_id, &self.embedding, &self.display_name) {
            (Some(_), _, _) => ResolutionState::Linked,
            (None, Some(_), Some(_)) => ResolutionState::LocalOnly,
            (None, Some(_), None) => ResolutionState::Extracted,
            (None, None, _) => ResolutionState::Unresolved,
        }
    }
}
