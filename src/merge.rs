// Merge engine
// Collapses two global identities into one, repointing every referencing
// recording speaker. All-or-nothing: runs inside a single transaction.

use anyhow::Context;
use rusqlite::params;

use crate::database::{speakers_repo, DatabaseManager, GlobalSpeaker};
use crate::error::{EngineError, EngineResult};

/// Marker error carried through the transaction when the target's version
/// counter moved underneath us.
#[derive(Debug)]
struct VersionMoved;

impl std::fmt::Display for VersionMoved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "merge target version moved")
    }
}

impl std::error::Error for VersionMoved {}

/// Marker for a source identity that vanished between the pre-read and
/// the transaction (a racing merge or delete won).
#[derive(Debug)]
struct SourceGone;

impl std::fmt::Display for SourceGone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "merge source already gone")
    }
}

impl std::error::Error for SourceGone {}

/// Merge `source_id` into `target_id`. Every recording speaker referencing
/// the source is repointed at the target, the source row is deleted, and
/// the target's version counter advances (rejecting concurrent merges of
/// the same identity). The target's reference embedding is never averaged
/// with the source's — the target, especially when locked, stays
/// authoritative.
pub fn merge_speakers(
    db: &DatabaseManager,
    source_id: i64,
    target_id: i64,
) -> EngineResult<GlobalSpeaker> {
    if source_id == target_id {
        return Err(EngineError::SelfMerge);
    }

    let target_version = {
        let target = db
            .get_global_speaker(target_id)?
            .ok_or_else(|| EngineError::not_found("global speaker", target_id))?;
        target.version
    };
    let source = db
        .get_global_speaker(source_id)?
        .ok_or_else(|| EngineError::not_found("global speaker", source_id))?;

    let merged = db.with_transaction(|tx| merge_in_tx(tx, &source, target_id, target_version));

    match merged {
        Ok(speaker) => Ok(speaker),
        Err(e) if e.downcast_ref::<VersionMoved>().is_some() => {
            Err(EngineError::Conflict(format!(
                "global speaker {target_id} was modified during merge; re-read and retry"
            )))
        }
        Err(e) if e.downcast_ref::<SourceGone>().is_some() => {
            Err(EngineError::Conflict(format!(
                "global speaker {source_id} was merged or deleted concurrently; re-read and retry"
            )))
        }
        Err(e) => Err(e.into()),
    }
}

fn merge_in_tx(
    tx: &rusqlite::Transaction,
    source: &GlobalSpeaker,
    target_id: i64,
    expected_target_version: i64,
) -> anyhow::Result<GlobalSpeaker> {
    // Collect the affected rows first, then apply one batch mutation.
    let affected: Vec<i64> = {
        let mut stmt = tx
            .prepare("SELECT id FROM recording_speakers WHERE global_speaker_id = ?1")
            .context("Failed to prepare merge collection query")?;
        let ids = stmt
            .query_map(params![source.id], |row| row.get(0))
            .context("Failed to collect referencing rows")?;
        ids.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read referencing rows")?
    };

    for rs_id in &affected {
        tx.execute(
            "UPDATE recording_speakers
             SET global_speaker_id = ?1, updated_at = datetime('now')
             WHERE id = ?2",
            params![target_id, rs_id],
        ).context("Failed to repoint recording speaker")?;
    }

    // A zero-row delete means a racing merge or delete of the same source
    // already won; reporting success here would double-count it.
    let deleted = tx.execute(
        "DELETE FROM global_speakers WHERE id = ?1",
        params![source.id],
    ).context("Failed to delete source speaker")?;
    if deleted == 0 {
        return Err(SourceGone.into());
    }

    // Advance the target's version so racing identity operations see
    // the row moved; stale version means someone got there first.
    let bumped = tx.execute(
        "UPDATE global_speakers
         SET version = version + 1, updated_at = datetime('now')
         WHERE id = ?1 AND version = ?2",
        params![target_id, expected_target_version],
    ).context("Failed to advance target version")?;
    if bumped == 0 {
        return Err(VersionMoved.into());
    }

    log::info!(
        "Merged speaker '{}' ({}) into {} — {} rows repointed",
        source.name, source.id, target_id, affected.len()
    );

    speakers_repo::get_global_speaker_impl(tx, target_id)?
        .context("Merge target missing after merge")
}
