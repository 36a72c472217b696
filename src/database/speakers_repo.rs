// Speakers repository for voicegraph
// CRUD for global speakers and recording-speaker rows, the persisted
// identity graph. The engines build on these primitives; multi-row
// mutations go through DatabaseManager::with_transaction.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{GlobalSpeaker, RecordingSpeaker};
use super::{embedding_from_json, embedding_to_json, DatabaseManager};

const GLOBAL_SPEAKER_COLUMNS: &str = r#"
    gs.id, gs.name, gs.embedding, gs.locked, gs.version, gs.created_at,
    (SELECT COUNT(DISTINCT rs.recording_id)
     FROM recording_speakers rs
     WHERE rs.global_speaker_id = gs.id)
"#;

const RECORDING_SPEAKER_COLUMNS: &str = r#"
    id, recording_id, diarization_label, global_speaker_id,
    display_name, embedding, created_at
"#;

impl DatabaseManager {
    /// Create a new global speaker, optionally with an initial embedding
    pub fn create_global_speaker(
        &self,
        name: &str,
        embedding: Option<&[f32]>,
    ) -> Result<GlobalSpeaker> {
        self.with_connection(|conn| {
            create_global_speaker_impl(conn, name, embedding)
        })
    }

    /// Get a global speaker by ID (recording_count included)
    pub fn get_global_speaker(&self, id: i64) -> Result<Option<GlobalSpeaker>> {
        self.with_connection(|conn| {
            get_global_speaker_impl(conn, id)
        })
    }

    /// List all global speakers, alphabetically
    pub fn list_global_speakers(&self) -> Result<Vec<GlobalSpeaker>> {
        self.with_connection(list_global_speakers_impl)
    }

    /// Rename a global speaker
    pub fn rename_global_speaker(&self, id: i64, new_name: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE global_speakers SET name = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![new_name, id],
            ).context("Failed to rename global speaker")?;
            Ok(changed > 0)
        })
    }

    /// Delete a global speaker, nullifying every referencing recording
    /// speaker first so no row is left pointing at a missing identity
    pub fn delete_global_speaker(&self, id: i64) -> Result<bool> {
        self.with_transaction(|tx| {
            tx.execute(
                "UPDATE recording_speakers
                 SET global_speaker_id = NULL, updated_at = datetime('now')
                 WHERE global_speaker_id = ?1",
                params![id],
            ).context("Failed to unlink recording speakers")?;

            let deleted = tx.execute(
                "DELETE FROM global_speakers WHERE id = ?1",
                params![id],
            ).context("Failed to delete global speaker")?;

            Ok(deleted > 0)
        })
    }

    /// Replace a speaker's reference embedding iff its version counter has
    /// not moved since it was read. Returns false when the row was modified
    /// concurrently (or no longer exists).
    pub fn try_update_reference_embedding(
        &self,
        id: i64,
        embedding: &[f32],
        expected_version: i64,
        lock: bool,
    ) -> Result<bool> {
        self.with_connection(|conn| {
            try_update_reference_embedding_impl(conn, id, embedding, expected_version, lock)
        })
    }

    /// Delete identities referenced by nothing. Returns how many were pruned.
    pub fn prune_dangling_speakers(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let pruned = conn.execute(
                "DELETE FROM global_speakers
                 WHERE id NOT IN (
                     SELECT DISTINCT global_speaker_id FROM recording_speakers
                     WHERE global_speaker_id IS NOT NULL
                 )",
                [],
            ).context("Failed to prune dangling speakers")?;
            if pruned > 0 {
                log::info!("Pruned {} dangling global speakers", pruned);
            }
            Ok(pruned)
        })
    }

    /// Register diarizer-assigned labels for a recording. Labels already
    /// present are left untouched (labels are unique per recording).
    pub fn add_diarization_labels(&self, recording_id: i64, labels: &[String]) -> Result<()> {
        self.with_connection(|conn| {
            for label in labels {
                conn.execute(
                    "INSERT OR IGNORE INTO recording_speakers (recording_id, diarization_label)
                     VALUES (?1, ?2)",
                    params![recording_id, label],
                ).context("Failed to add diarization label")?;
            }
            log::debug!(
                "Registered {} diarization labels for recording {}",
                labels.len(),
                recording_id
            );
            Ok(())
        })
    }

    /// Get the recording speaker for a (recording, label) pair
    pub fn get_recording_speaker(
        &self,
        recording_id: i64,
        label: &str,
    ) -> Result<Option<RecordingSpeaker>> {
        self.with_connection(|conn| {
            get_recording_speaker_impl(conn, recording_id, label)
        })
    }

    /// All speaker rows for one recording, by label
    pub fn list_speakers_for_recording(&self, recording_id: i64) -> Result<Vec<RecordingSpeaker>> {
        self.with_connection(|conn| {
            query_recording_speakers(
                conn,
                "WHERE recording_id = ?1 ORDER BY diarization_label",
                params![recording_id],
            )
        })
    }

    /// All speaker rows linked to one global identity
    pub fn list_speakers_for_global(&self, global_speaker_id: i64) -> Result<Vec<RecordingSpeaker>> {
        self.with_connection(|conn| {
            list_speakers_for_global_impl(conn, global_speaker_id)
        })
    }

    /// All unlinked rows in the library — scanner input
    pub fn list_unlinked_speakers(&self) -> Result<Vec<RecordingSpeaker>> {
        self.with_connection(|conn| {
            query_recording_speakers(
                conn,
                "WHERE global_speaker_id IS NULL ORDER BY recording_id, diarization_label",
                params![],
            )
        })
    }

    /// Store the embedding snapshot captured at extraction time
    pub fn set_speaker_snapshot(&self, recording_speaker_id: i64, embedding: &[f32]) -> Result<()> {
        self.with_connection(|conn| {
            let json = embedding_to_json(embedding)?;
            conn.execute(
                "UPDATE recording_speakers
                 SET embedding = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![json, recording_speaker_id],
            ).context("Failed to store embedding snapshot")?;
            Ok(())
        })
    }

    /// Discard the embedding snapshot for a (recording, label) pair
    pub fn clear_speaker_snapshot(&self, recording_id: i64, label: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE recording_speakers
                 SET embedding = NULL, updated_at = datetime('now')
                 WHERE recording_id = ?1 AND diarization_label = ?2",
                params![recording_id, label],
            ).context("Failed to clear embedding snapshot")?;
            Ok(changed > 0)
        })
    }

    /// Point a recording speaker at a global identity (or unlink with None)
    pub fn set_speaker_link(
        &self,
        recording_speaker_id: i64,
        global_speaker_id: Option<i64>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE recording_speakers
                 SET global_speaker_id = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![global_speaker_id, recording_speaker_id],
            ).context("Failed to update speaker link")?;
            Ok(())
        })
    }

    /// Link a row only if it is still unlinked. Used by the scanner so a
    /// row linked by someone else mid-scan is skipped, not overwritten.
    pub fn try_link_if_unlinked(
        &self,
        recording_speaker_id: i64,
        global_speaker_id: i64,
    ) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE recording_speakers
                 SET global_speaker_id = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND global_speaker_id IS NULL",
                params![global_speaker_id, recording_speaker_id],
            ).context("Failed to conditionally link speaker")?;
            Ok(changed > 0)
        })
    }

    /// Set or clear the local display-name override
    pub fn set_speaker_display_name(
        &self,
        recording_speaker_id: i64,
        display_name: Option<&str>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE recording_speakers
                 SET display_name = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![display_name, recording_speaker_id],
            ).context("Failed to update display name")?;
            Ok(())
        })
    }
}

pub(crate) fn create_global_speaker_impl(
    conn: &Connection,
    name: &str,
    embedding: Option<&[f32]>,
) -> Result<GlobalSpeaker> {
    let json = embedding.map(embedding_to_json).transpose()?;
    conn.execute(
        "INSERT INTO global_speakers (name, embedding) VALUES (?1, ?2)",
        params![name, json],
    ).context("Failed to create global speaker")?;

    let id = conn.last_insert_rowid();
    log::info!("Created global speaker '{}' with ID {}", name, id);

    get_global_speaker_impl(conn, id)?
        .context("Global speaker missing after insert")
}

pub(crate) fn get_global_speaker_impl(conn: &Connection, id: i64) -> Result<Option<GlobalSpeaker>> {
    let query = format!(
        "SELECT {} FROM global_speakers gs WHERE gs.id = ?1",
        GLOBAL_SPEAKER_COLUMNS
    );
    let mut stmt = conn.prepare(&query)
        .context("Failed to prepare get_global_speaker query")?;

    let row = stmt.query_row(params![id], map_global_speaker_row)
        .optional()
        .context("Failed to get global speaker")?;

    row.map(finish_global_speaker).transpose()
}

pub(crate) fn list_global_speakers_impl(conn: &Connection) -> Result<Vec<GlobalSpeaker>> {
    let query = format!(
        "SELECT {} FROM global_speakers gs ORDER BY gs.name COLLATE NOCASE",
        GLOBAL_SPEAKER_COLUMNS
    );
    let mut stmt = conn.prepare(&query)
        .context("Failed to prepare list_global_speakers query")?;

    let rows = stmt.query_map([], map_global_speaker_row)
        .context("Failed to query global speakers")?;

    let mut speakers = Vec::new();
    for row in rows {
        let raw = row.context("Failed to read global speaker row")?;
        speakers.push(finish_global_speaker(raw)?);
    }
    Ok(speakers)
}

pub(crate) fn try_update_reference_embedding_impl(
    conn: &Connection,
    id: i64,
    embedding: &[f32],
    expected_version: i64,
    lock: bool,
) -> Result<bool> {
    let json = embedding_to_json(embedding)?;
    let changed = conn.execute(
        "UPDATE global_speakers
         SET embedding = ?1,
             locked = CASE WHEN ?2 THEN 1 ELSE locked END,
             version = version + 1,
             updated_at = datetime('now')
         WHERE id = ?3 AND version = ?4",
        params![json, lock, id, expected_version],
    ).context("Failed to update reference embedding")?;
    Ok(changed > 0)
}

pub(crate) fn get_recording_speaker_impl(
    conn: &Connection,
    recording_id: i64,
    label: &str,
) -> Result<Option<RecordingSpeaker>> {
    let query = format!(
        "SELECT {} FROM recording_speakers WHERE recording_id = ?1 AND diarization_label = ?2",
        RECORDING_SPEAKER_COLUMNS
    );
    let mut stmt = conn.prepare(&query)
        .context("Failed to prepare get_recording_speaker query")?;

    let row = stmt.query_row(params![recording_id, label], map_recording_speaker_row)
        .optional()
        .context("Failed to get recording speaker")?;

    row.map(finish_recording_speaker).transpose()
}

pub(crate) fn list_speakers_for_global_impl(
    conn: &Connection,
    global_speaker_id: i64,
) -> Result<Vec<RecordingSpeaker>> {
    query_recording_speakers(
        conn,
        "WHERE global_speaker_id = ?1 ORDER BY recording_id, diarization_label",
        params![global_speaker_id],
    )
}

fn query_recording_speakers(
    conn: &Connection,
    suffix: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<RecordingSpeaker>> {
    let query = format!(
        "SELECT {} FROM recording_speakers {}",
        RECORDING_SPEAKER_COLUMNS, suffix
    );
    let mut stmt = conn.prepare(&query)
        .context("Failed to prepare recording_speakers query")?;

    let rows = stmt.query_map(params, map_recording_speaker_row)
        .context("Failed to query recording speakers")?;

    let mut speakers = Vec::new();
    for row in rows {
        let raw = row.context("Failed to read recording speaker row")?;
        speakers.push(finish_recording_speaker(raw)?);
    }
    Ok(speakers)
}

// Raw row with the embedding column still serialized; JSON decoding happens
// outside the rusqlite row callback so errors carry context.
struct RawGlobalSpeaker(GlobalSpeaker, Option<String>);
struct RawRecordingSpeaker(RecordingSpeaker, Option<String>);

fn map_global_speaker_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawGlobalSpeaker> {
    Ok(RawGlobalSpeaker(
        GlobalSpeaker {
            id: row.get(0)?,
            name: row.get(1)?,
            embedding: None,
            locked: row.get::<_, i64>(3)? != 0,
            version: row.get(4)?,
            created_at: row.get(5)?,
            recording_count: row.get(6)?,
        },
        row.get(2)?,
    ))
}

fn finish_global_speaker(raw: RawGlobalSpeaker) -> Result<GlobalSpeaker> {
    let RawGlobalSpeaker(mut speaker, json) = raw;
    speaker.embedding = embedding_from_json(json)?;
    Ok(speaker)
}

fn map_recording_speaker_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecordingSpeaker> {
    Ok(RawRecordingSpeaker(
        RecordingSpeaker {
            id: row.get(0)?,
            recording_id: row.get(1)?,
            diarization_label: row.get(2)?,
            global_speaker_id: row.get(3)?,
            display_name: row.get(4)?,
            embedding: None,
            created_at: row.get(6)?,
        },
        row.get(5)?,
    ))
}

fn finish_recording_speaker(raw: RawRecordingSpeaker) -> Result<RecordingSpeaker> {
    let RawRecordingSpeaker(mut speaker, json) = raw;
    speaker.embedding = embedding_from_json(json)?;
    Ok(speaker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_db() -> (tempfile::TempDir, DatabaseManager) {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_create_and_get_global_speaker() {
        let (_dir, db) = create_test_db();

        let created = db.create_global_speaker("Ada", Some(&[0.1, 0.2, 0.3])).unwrap();
        assert!(!created.locked);
        assert_eq!(created.version, 0);
        assert_eq!(created.recording_count, 0);

        let fetched = db.get_global_speaker(created.id).unwrap().unwrap();
        assert_eq!(fetched.name, "Ada");
        assert_eq!(fetched.embedding.unwrap(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_labels_unique_per_recording() {
        let (_dir, db) = create_test_db();
        db.create_recording(1, "r").unwrap();

        let labels = vec!["SPEAKER_00".to_string(), "SPEAKER_01".to_string()];
        db.add_diarization_labels(1, &labels).unwrap();
        // Re-registering the same labels must not duplicate rows
        db.add_diarization_labels(1, &labels).unwrap();

        let speakers = db.list_speakers_for_recording(1).unwrap();
        assert_eq!(speakers.len(), 2);
    }

    #[test]
    fn test_recording_count_is_distinct_recordings() {
        let (_dir, db) = create_test_db();
        db.create_recording(1, "a").unwrap();
        db.create_recording(2, "b").unwrap();
        let gs = db.create_global_speaker("Ada", None).unwrap();

        for (rec, label) in [(1, "SPEAKER_00"), (1, "SPEAKER_01"), (2, "SPEAKER_00")] {
            db.add_diarization_labels(rec, &[label.to_string()]).unwrap();
            let rs = db.get_recording_speaker(rec, label).unwrap().unwrap();
            db.set_speaker_link(rs.id, Some(gs.id)).unwrap();
        }

        // Two labels in recording 1 plus one in recording 2 span 2 recordings
        let gs = db.get_global_speaker(gs.id).unwrap().unwrap();
        assert_eq!(gs.recording_count, 2);
    }

    #[test]
    fn test_optimistic_embedding_update() {
        let (_dir, db) = create_test_db();
        let gs = db.create_global_speaker("Ada", None).unwrap();

        assert!(db
            .try_update_reference_embedding(gs.id, &[1.0, 0.0], gs.version, true)
            .unwrap());

        let updated = db.get_global_speaker(gs.id).unwrap().unwrap();
        assert!(updated.locked);
        assert_eq!(updated.version, gs.version + 1);

        // Stale version must be rejected
        assert!(!db
            .try_update_reference_embedding(gs.id, &[0.0, 1.0], gs.version, false)
            .unwrap());
        let unchanged = db.get_global_speaker(gs.id).unwrap().unwrap();
        assert_eq!(unchanged.embedding.unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_conditional_link_skips_taken_rows() {
        let (_dir, db) = create_test_db();
        db.create_recording(1, "r").unwrap();
        db.add_diarization_labels(1, &["SPEAKER_00".to_string()]).unwrap();
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        let a = db.create_global_speaker("Ada", None).unwrap();
        let b = db.create_global_speaker("Bea", None).unwrap();

        assert!(db.try_link_if_unlinked(rs.id, a.id).unwrap());
        // Someone already linked it; the second attempt is a no-op
        assert!(!db.try_link_if_unlinked(rs.id, b.id).unwrap());

        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        assert_eq!(rs.global_speaker_id, Some(a.id));
    }

    #[test]
    fn test_delete_global_speaker_nullifies_references() {
        let (_dir, db) = create_test_db();
        db.create_recording(1, "r").unwrap();
        db.add_diarization_labels(1, &["SPEAKER_00".to_string()]).unwrap();
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        let gs = db.create_global_speaker("Ada", None).unwrap();
        db.set_speaker_link(rs.id, Some(gs.id)).unwrap();

        assert!(db.delete_global_speaker(gs.id).unwrap());

        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        assert_eq!(rs.global_speaker_id, None);
    }

    #[test]
    fn test_prune_dangling_speakers() {
        let (_dir, db) = create_test_db();
        db.create_recording(1, "r").unwrap();
        db.add_diarization_labels(1, &["SPEAKER_00".to_string()]).unwrap();
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();

        let kept = db.create_global_speaker("Ada", None).unwrap();
        db.set_speaker_link(rs.id, Some(kept.id)).unwrap();
        db.create_global_speaker("Orphan", None).unwrap();

        assert_eq!(db.prune_dangling_speakers().unwrap(), 1);
        assert!(db.get_global_speaker(kept.id).unwrap().is_some());
    }

    #[test]
    fn test_snapshot_roundtrip_and_clear() {
        let (_dir, db) = create_test_db();
        db.create_recording(1, "r").unwrap();
        db.add_diarization_labels(1, &["SPEAKER_00".to_string()]).unwrap();
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();

        db.set_speaker_snapshot(rs.id, &[0.5, -0.5]).unwrap();
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        assert_eq!(rs.embedding.unwrap(), vec![0.5, -0.5]);

        assert!(db.clear_speaker_snapshot(1, "SPEAKER_00").unwrap());
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        assert!(rs.embedding.is_none());
    }
}
