// Error types for the identity resolution engine
// One variant per failure class surfaced to callers

use thiserror::Error;

/// Errors produced by identity resolution operations.
///
/// The variants fall into a small taxonomy: missing rows (`NotFound`),
/// rejected inputs (`InvalidArgument`, `SelfMerge`, `EmptySelection`,
/// `PartialLabelSelection`, `InsufficientSamples`), concurrent-modification
/// races (`Conflict`), gateway failures (`ExtractionFailed`), and resolution
/// attempts on already-resolved rows (`AlreadyLinked`).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cannot merge a speaker into itself")]
    SelfMerge,

    #[error("no segments selected for split")]
    EmptySelection,

    #[error("label '{label}' in recording {recording_id} is only partially selected; select all of its segments or none")]
    PartialLabelSelection { recording_id: i64, label: String },

    #[error("recalibration needs at least {need} approved segments, got {got}")]
    InsufficientSamples { got: usize, need: usize },

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("embedding extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("label '{label}' in recording {recording_id} is already linked to global speaker {linked_to}; unlink it first")]
    AlreadyLinked {
        recording_id: i64,
        label: String,
        linked_to: i64,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a batch operation should skip this error and continue
    /// with the remaining items.
    pub fn is_recoverable_in_batch(&self) -> bool {
        matches!(self, EngineError::ExtractionFailed(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
