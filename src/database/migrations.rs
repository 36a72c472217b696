// Database migrations for voicegraph
// Creates and updates the identity graph schema

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Current schema version
const SCHEMA_VERSION: i32 = 2;

/// Run all necessary migrations to bring the database up to date
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version from the database
fn get_schema_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    ).unwrap_or(false);

    if !table_exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get(0),
    ).unwrap_or(0);

    Ok(version)
}

/// Initial schema creation (version 1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v1");

    conn.execute_batch(r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Recordings: anchor rows for recording-scoped data.
        -- Audio files and transcription state live outside this engine.
        CREATE TABLE IF NOT EXISTS recordings (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Global speakers: persistent cross-recording identities
        CREATE TABLE IF NOT EXISTS global_speakers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            embedding TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Recording speakers: one diarization label within one recording,
        -- optionally linked to a global identity
        CREATE TABLE IF NOT EXISTS recording_speakers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recording_id INTEGER NOT NULL REFERENCES recordings(id) ON DELETE CASCADE,
            diarization_label TEXT NOT NULL,
            global_speaker_id INTEGER REFERENCES global_speakers(id),
            display_name TEXT,
            embedding TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(recording_id, diarization_label)
        );

        CREATE INDEX IF NOT EXISTS idx_recording_speakers_global
        ON recording_speakers(global_speaker_id);

        -- Transcript segments: immutable utterances owned by the transcript
        -- store; the engine reads them for training sets and splits
        CREATE TABLE IF NOT EXISTS transcript_segments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recording_id INTEGER NOT NULL REFERENCES recordings(id) ON DELETE CASCADE,
            diarization_label TEXT NOT NULL,
            start_time REAL NOT NULL,
            end_time REAL NOT NULL,
            text TEXT NOT NULL,
            CHECK (end_time > start_time)
        );

        CREATE INDEX IF NOT EXISTS idx_transcript_segments_label
        ON transcript_segments(recording_id, diarization_label);

        INSERT INTO schema_version (version) VALUES (1);
    "#).context("Failed to run migration v1")?;

    Ok(())
}

/// Version 2: recalibration support — the locked flag and the optimistic
/// version counter on global speakers
fn migrate_v2(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v2");

    conn.execute_batch(r#"
        ALTER TABLE global_speakers ADD COLUMN locked INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE global_speakers ADD COLUMN version INTEGER NOT NULL DEFAULT 0;

        INSERT INTO schema_version (version) VALUES (2);
    "#).context("Failed to run migration v2")?;

    Ok(())
}
