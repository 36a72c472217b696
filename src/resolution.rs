// Resolution applier
// Writes a single human/automatic identity decision into the graph

use anyhow::Context;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::database::{speakers_repo, DatabaseManager, GlobalSpeaker, RecordingSpeaker};
use crate::error::{EngineError, EngineResult};

/// The four-way resolution decision for an extracted voiceprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VoiceprintAction {
    /// Allocate a fresh global identity seeded with the extracted vector.
    CreateNew { name: String },
    /// Link to an existing identity following a match.
    LinkExisting { speaker_id: i64 },
    /// Name the speaker for this recording only; excluded from
    /// cross-recording matching until promoted.
    LocalOnly { name: Option<String> },
    /// Link despite no or only a weak match.
    ForceLink { speaker_id: i64 },
}

/// What a resolution produced.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionOutcome {
    pub recording_speaker: RecordingSpeaker,
    /// The linked identity, when the decision produced one.
    pub speaker: Option<GlobalSpeaker>,
}

/// Apply one resolution decision to a (recording, label) pair.
///
/// Linking never perturbs the target's reference embedding; only
/// recalibration and splits do that. A row already carrying a different
/// link fails with `AlreadyLinked` — callers unlink explicitly first.
pub fn apply_resolution(
    db: &DatabaseManager,
    recording_id: i64,
    label: &str,
    action: VoiceprintAction,
) -> EngineResult<ResolutionOutcome> {
    let rs = db
        .get_recording_speaker(recording_id, label)?
        .ok_or_else(|| {
            EngineError::not_found("recording speaker", format!("{recording_id}/{label}"))
        })?;

    // Idempotent re-link to the same identity is a no-op; anything else on
    // a linked row needs an explicit unlink first.
    if let Some(linked_to) = rs.global_speaker_id {
        let same_target = matches!(
            action,
            VoiceprintAction::LinkExisting { speaker_id }
            | VoiceprintAction::ForceLink { speaker_id } if speaker_id == linked_to
        );
        if !same_target {
            return Err(EngineError::AlreadyLinked {
                recording_id,
                label: label.to_string(),
                linked_to,
            });
        }
        let speaker = db.get_global_speaker(linked_to)?;
        return Ok(ResolutionOutcome {
            recording_speaker: rs,
            speaker,
        });
    }

    match action {
        VoiceprintAction::CreateNew { name } => {
            let embedding = require_snapshot(&rs, recording_id, label)?;
            let name = if name.trim().is_empty() {
                // Placeholder until renamed; kept out of matching by name
                chrono::Local::now().format("New Voice %Y-%m-%d %H:%M").to_string()
            } else {
                name
            };
            // Create and link in one transaction so a failure cannot leave
            // a dangling identity behind
            let speaker = db.with_transaction(|tx| {
                let speaker =
                    speakers_repo::create_global_speaker_impl(tx, &name, Some(&embedding))?;
                tx.execute(
                    "UPDATE recording_speakers
                     SET global_speaker_id = ?1, updated_at = datetime('now')
                     WHERE id = ?2",
                    params![speaker.id, rs.id],
                ).context("Failed to link created speaker")?;
                Ok(speaker)
            })?;
            log::info!(
                "Created global speaker '{}' ({}) from {}/{}",
                speaker.name, speaker.id, recording_id, label
            );
            finish(db, recording_id, label, Some(speaker.id))
        }
        VoiceprintAction::LinkExisting { speaker_id }
        | VoiceprintAction::ForceLink { speaker_id } => {
            let speaker = db
                .get_global_speaker(speaker_id)?
                .ok_or_else(|| EngineError::not_found("global speaker", speaker_id))?;
            db.set_speaker_link(rs.id, Some(speaker.id))?;
            log::info!(
                "Linked {}/{} to global speaker '{}' ({})",
                recording_id, label, speaker.name, speaker.id
            );
            finish(db, recording_id, label, Some(speaker.id))
        }
        VoiceprintAction::LocalOnly { name } => {
            require_snapshot(&rs, recording_id, label)?;
            if let Some(ref name) = name {
                db.set_speaker_display_name(rs.id, Some(name))?;
            }
            log::info!("Marked {}/{} as local-only", recording_id, label);
            finish(db, recording_id, label, None)
        }
    }
}

/// Remove a (recording, label) link, making the row unresolved again.
pub fn unlink(db: &DatabaseManager, recording_id: i64, label: &str) -> EngineResult<RecordingSpeaker> {
    let rs = db
        .get_recording_speaker(recording_id, label)?
        .ok_or_else(|| {
            EngineError::not_found("recording speaker", format!("{recording_id}/{label}"))
        })?;
    db.set_speaker_link(rs.id, None)?;
    log::info!("Unlinked {}/{}", recording_id, label);
    db.get_recording_speaker(recording_id, label)?
        .ok_or_else(|| {
            EngineError::not_found("recording speaker", format!("{recording_id}/{label}"))
        })
}

fn require_snapshot(
    rs: &RecordingSpeaker,
    recording_id: i64,
    label: &str,
) -> EngineResult<Vec<f32>> {
    rs.embedding.clone().ok_or_else(|| {
        EngineError::InvalidArgument(format!(
            "no extracted voiceprint for {recording_id}/{label}; extract first"
        ))
    })
}

fn finish(
    db: &DatabaseManager,
    recording_id: i64,
    label: &str,
    speaker_id: Option<i64>,
) -> EngineResult<ResolutionOutcome> {
    let recording_speaker = db
        .get_recording_speaker(recording_id, label)?
        .ok_or_else(|| {
            EngineError::not_found("recording speaker", format!("{recording_id}/{label}"))
        })?;
    let speaker = speaker_id.map(|id| db.get_global_speaker(id)).transpose()?.flatten();
    Ok(ResolutionOutcome {
        recording_speaker,
        speaker,
    })
}
