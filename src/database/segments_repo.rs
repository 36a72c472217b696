// Segments repository for voicegraph
// Read access to transcript segments plus the ingest path used by the
// external transcript store. The engine never edits segment text or times.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use super::models::Segment;
use super::DatabaseManager;

/// Ingest shape for a single segment; ids are assigned by the database.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub diarization_label: String,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

impl DatabaseManager {
    /// Batch-insert transcript segments for a recording (ingest path)
    pub fn add_transcript_segments(
        &self,
        recording_id: i64,
        segments: &[NewSegment],
    ) -> Result<()> {
        self.with_transaction(|tx| {
            for segment in segments {
                tx.execute(
                    "INSERT INTO transcript_segments
                     (recording_id, diarization_label, start_time, end_time, text)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        recording_id,
                        segment.diarization_label,
                        segment.start_time,
                        segment.end_time,
                        segment.text,
                    ],
                ).context("Failed to insert transcript segment")?;
            }
            Ok(())
        })
    }

    /// All segments for one diarization label in one recording
    pub fn get_segments_for_label(
        &self,
        recording_id: i64,
        label: &str,
    ) -> Result<Vec<Segment>> {
        self.with_connection(|conn| {
            get_segments_for_label_impl(conn, recording_id, label)
        })
    }

    /// All segments attributed to a global speaker, across every linked
    /// recording speaker
    pub fn get_segments_for_global_speaker(&self, global_speaker_id: i64) -> Result<Vec<Segment>> {
        self.with_connection(|conn| {
            get_segments_for_global_speaker_impl(conn, global_speaker_id)
        })
    }
}

pub(crate) fn get_segments_for_label_impl(
    conn: &Connection,
    recording_id: i64,
    label: &str,
) -> Result<Vec<Segment>> {
    let mut stmt = conn.prepare(
        "SELECT id, recording_id, diarization_label, start_time, end_time, text
         FROM transcript_segments
         WHERE recording_id = ?1 AND diarization_label = ?2
         ORDER BY start_time",
    ).context("Failed to prepare get_segments_for_label query")?;

    let rows = stmt.query_map(params![recording_id, label], map_segment_row)
        .context("Failed to query segments")?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect segments")
}

pub(crate) fn get_segments_for_global_speaker_impl(
    conn: &Connection,
    global_speaker_id: i64,
) -> Result<Vec<Segment>> {
    let mut stmt = conn.prepare(
        "SELECT ts.id, ts.recording_id, ts.diarization_label, ts.start_time, ts.end_time, ts.text
         FROM transcript_segments ts
         JOIN recording_speakers rs
           ON rs.recording_id = ts.recording_id
          AND rs.diarization_label = ts.diarization_label
         WHERE rs.global_speaker_id = ?1
         ORDER BY ts.recording_id, ts.start_time",
    ).context("Failed to prepare get_segments_for_global_speaker query")?;

    let rows = stmt.query_map(params![global_speaker_id], map_segment_row)
        .context("Failed to query attributed segments")?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect attributed segments")
}

fn map_segment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: row.get(0)?,
        recording_id: row.get(1)?,
        diarization_label: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        text: row.get(5)?,
    })
}
