// Database module for voicegraph
// Provides SQLite persistence for the identity graph: recordings,
// global speakers, recording speakers, and transcript segments

pub mod manager;
pub mod migrations;
pub mod models;
pub mod recordings_repo;
pub mod segments_repo;
pub mod speakers_repo;

pub use manager::DatabaseManager;
pub use models::*;
pub use segments_repo::NewSegment;

use anyhow::{Context, Result};

/// Serialize an embedding vector for storage in a TEXT column.
pub(crate) fn embedding_to_json(embedding: &[f32]) -> Result<String> {
    serde_json::to_string(embedding).context("Failed to serialize embedding")
}

/// Deserialize an optional embedding column.
pub(crate) fn embedding_from_json(value: Option<String>) -> Result<Option<Vec<f32>>> {
    match value {
        Some(text) => {
            let embedding =
                serde_json::from_str(&text).context("Failed to deserialize embedding")?;
            Ok(Some(embedding))
        }
        None => Ok(None),
    }
}
