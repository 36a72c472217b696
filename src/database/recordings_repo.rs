// Recordings repository for voicegraph
// Anchor rows for recording-scoped speaker and segment data

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use super::models::Recording;
use super::DatabaseManager;

impl DatabaseManager {
    /// Create a recording anchor row
    pub fn create_recording(&self, id: i64, title: &str) -> Result<Recording> {
        self.with_connection(|conn| {
            create_recording_impl(conn, id, title)
        })
    }

    /// Get a recording by ID
    pub fn get_recording(&self, id: i64) -> Result<Option<Recording>> {
        self.with_connection(|conn| {
            get_recording_impl(conn, id)
        })
    }

    /// Check whether a recording exists
    pub fn recording_exists(&self, id: i64) -> Result<bool> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM recordings WHERE id = ?1",
                params![id],
                |row| row.get(0),
            ).context("Failed to check recording existence")?;
            Ok(count > 0)
        })
    }
}

fn create_recording_impl(conn: &Connection, id: i64, title: &str) -> Result<Recording> {
    conn.execute(
        "INSERT INTO recordings (id, title) VALUES (?1, ?2)",
        params![id, title],
    ).context("Failed to create recording")?;

    get_recording_impl(conn, id)?
        .context("Recording missing after insert")
}

fn get_recording_impl(conn: &Connection, id: i64) -> Result<Option<Recording>> {
    let result = conn.query_row(
        "SELECT id, title, created_at FROM recordings WHERE id = ?1",
        params![id],
        |row| {
            Ok(Recording {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
            })
        },
    );

    match result {
        Ok(recording) => Ok(Some(recording)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to get recording"),
    }
}
