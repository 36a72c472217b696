// Split engine
// Carves a subset of a speaker's segments into a brand-new identity.
// Works at diarization-label granularity: a label moves whole or not at
// all — the engine never subdivides finer than the labels it was given.

use anyhow::Context;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::database::{
    speakers_repo, DatabaseManager, GlobalSpeaker, RecordingSpeaker, Segment,
};
use crate::error::{EngineError, EngineResult};
use crate::gateway::{EmbeddingGateway, ExtractionRequest, TimeRange};
use crate::recalibrate::centroid;

/// One selected segment range to move to the new identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmentSelection {
    pub recording_id: i64,
    pub start: f64,
    pub end: f64,
}

impl SegmentSelection {
    fn selects(&self, segment: &Segment) -> bool {
        self.recording_id == segment.recording_id
            && TimeRange::new(self.start, self.end).covers(segment.start_time, segment.end_time)
    }
}

/// Result of a split.
#[derive(Debug, Clone, Serialize)]
pub struct SplitOutcome {
    pub origin: GlobalSpeaker,
    pub created: GlobalSpeaker,
    /// True when every attributed segment moved — a degenerate split that
    /// leaves the origin with no recordings (effectively a rename).
    pub origin_emptied: bool,
}

// A recording speaker together with its attributed segments.
struct Cluster {
    row: RecordingSpeaker,
    segments: Vec<Segment>,
}

/// Split the selected segments of `speaker_id` into a new identity named
/// `new_name`. Both sides' reference embeddings are recomputed through the
/// gateway *before* the structural change commits, so the operation is
/// atomic: a failed extraction leaves the graph untouched.
pub async fn split_speaker(
    db: &DatabaseManager,
    gateway: &dyn EmbeddingGateway,
    config: &EngineConfig,
    speaker_id: i64,
    new_name: &str,
    selections: &[SegmentSelection],
) -> EngineResult<SplitOutcome> {
    if selections.is_empty() {
        return Err(EngineError::EmptySelection);
    }

    let origin = db
        .get_global_speaker(speaker_id)?
        .ok_or_else(|| EngineError::not_found("global speaker", speaker_id))?;

    // Partition the origin's rows: a row moves when all of its segments
    // are selected; a partially selected label is an error rather than a
    // guess at sub-label intent.
    let mut moved: Vec<Cluster> = Vec::new();
    let mut remaining: Vec<Cluster> = Vec::new();
    for row in db.list_speakers_for_global(origin.id)? {
        let segments = db.get_segments_for_label(row.recording_id, &row.diarization_label)?;
        let selected = segments
            .iter()
            .filter(|seg| selections.iter().any(|sel| sel.selects(seg)))
            .count();

        if selected == 0 {
            remaining.push(Cluster { row, segments });
        } else if selected == segments.len() {
            moved.push(Cluster { row, segments });
        } else {
            return Err(EngineError::PartialLabelSelection {
                recording_id: row.recording_id,
                label: row.diarization_label,
            });
        }
    }

    if moved.is_empty() {
        return Err(EngineError::InvalidArgument(
            "selection matches no attributed segments".to_string(),
        ));
    }

    // Fresh extraction per cluster, both sides, before any write.
    let created_embedding = cluster_embedding(gateway, config, &moved)
        .await?
        .ok_or_else(|| {
            EngineError::ExtractionFailed("no usable embeddings for split cluster".to_string())
        })?;
    // Remaining rows without any transcript segments leave nothing to
    // re-embed; the origin then keeps its old vector.
    let origin_embedding = if remaining.is_empty() {
        None
    } else {
        cluster_embedding(gateway, config, &remaining).await?
    };

    let origin_emptied = remaining.is_empty();
    let moved_ids: Vec<i64> = moved.iter().map(|c| c.row.id).collect();

    let result = db.with_transaction(|tx| {
        let created =
            speakers_repo::create_global_speaker_impl(tx, new_name, Some(&created_embedding))?;

        for rs_id in &moved_ids {
            // Conditional: a row unlinked or relinked by a concurrent
            // decision during extraction aborts the split instead of
            // being clobbered.
            let changed = tx.execute(
                "UPDATE recording_speakers
                 SET global_speaker_id = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND global_speaker_id = ?3",
                params![created.id, rs_id, origin.id],
            ).context("Failed to repoint recording speaker")?;
            if changed == 0 {
                return Err(LinkMoved.into());
            }
        }

        let updated = match &origin_embedding {
            Some(embedding) => speakers_repo::try_update_reference_embedding_impl(
                tx,
                origin.id,
                embedding,
                origin.version,
                false,
            )?,
            // Degenerate split: the origin keeps its old vector, but its
            // version still advances to fence racing operations.
            None => tx.execute(
                "UPDATE global_speakers
                 SET version = version + 1, updated_at = datetime('now')
                 WHERE id = ?1 AND version = ?2",
                params![origin.id, origin.version],
            ).context("Failed to advance origin version")? > 0,
        };
        if !updated {
            return Err(VersionMoved.into());
        }

        let origin_row = speakers_repo::get_global_speaker_impl(tx, origin.id)?
            .context("Origin missing after split")?;
        let created_row = speakers_repo::get_global_speaker_impl(tx, created.id)?
            .context("Created speaker missing after split")?;
        Ok((origin_row, created_row))
    });

    match result {
        Ok((origin, created)) => {
            log::info!(
                "Split {} labels off speaker '{}' ({}) into '{}' ({}){}",
                moved_ids.len(),
                origin.name,
                origin.id,
                created.name,
                created.id,
                if origin_emptied { " — origin emptied" } else { "" }
            );
            Ok(SplitOutcome {
                origin,
                created,
                origin_emptied,
            })
        }
        Err(e) if e.downcast_ref::<VersionMoved>().is_some() => {
            Err(EngineError::Conflict(format!(
                "global speaker {speaker_id} was modified during split; re-read and retry"
            )))
        }
        Err(e) if e.downcast_ref::<LinkMoved>().is_some() => {
            Err(EngineError::Conflict(format!(
                "a label attributed to speaker {speaker_id} was relinked during split; re-read and retry"
            )))
        }
        Err(e) => Err(e.into()),
    }
}

/// Local split: promote an unresolved (recording, label) pair into a fresh
/// identity. The selection must cover the whole label.
pub async fn split_unresolved(
    db: &DatabaseManager,
    gateway: &dyn EmbeddingGateway,
    recording_id: i64,
    label: &str,
    new_name: &str,
    selections: &[SegmentSelection],
) -> EngineResult<SplitOutcome> {
    if selections.is_empty() {
        return Err(EngineError::EmptySelection);
    }

    let rs = db
        .get_recording_speaker(recording_id, label)?
        .ok_or_else(|| {
            EngineError::not_found("recording speaker", format!("{recording_id}/{label}"))
        })?;
    if let Some(linked_to) = rs.global_speaker_id {
        return Err(EngineError::AlreadyLinked {
            recording_id,
            label: label.to_string(),
            linked_to,
        });
    }

    let segments = db.get_segments_for_label(recording_id, label)?;
    let selected = segments
        .iter()
        .filter(|seg| selections.iter().any(|sel| sel.selects(seg)))
        .count();
    if selected == 0 {
        return Err(EngineError::InvalidArgument(
            "selection matches no segments of this label".to_string(),
        ));
    }
    if selected != segments.len() {
        return Err(EngineError::PartialLabelSelection {
            recording_id,
            label: label.to_string(),
        });
    }

    let ranges: Vec<TimeRange> = segments
        .iter()
        .map(|seg| TimeRange::new(seg.start_time, seg.end_time))
        .collect();
    let embedding = gateway
        .extract(recording_id, ExtractionRequest::Ranges(ranges))
        .await?;

    let result = db.with_transaction(|tx| {
        let created = speakers_repo::create_global_speaker_impl(tx, new_name, Some(&embedding))?;
        let changed = tx.execute(
            "UPDATE recording_speakers
             SET global_speaker_id = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND global_speaker_id IS NULL",
            params![created.id, rs.id],
        ).context("Failed to link promoted speaker")?;
        if changed == 0 {
            return Err(LinkMoved.into());
        }
        speakers_repo::get_global_speaker_impl(tx, created.id)?
            .context("Created speaker missing after local split")
    });
    let created = match result {
        Ok(created) => created,
        Err(e) if e.downcast_ref::<LinkMoved>().is_some() => {
            return Err(EngineError::Conflict(format!(
                "{recording_id}/{label} was linked during promotion; re-read and retry"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    log::info!(
        "Promoted {}/{} into new speaker '{}' ({})",
        recording_id, label, created.name, created.id
    );

    Ok(SplitOutcome {
        origin: created.clone(),
        created,
        origin_emptied: false,
    })
}

/// One embedding per recording-speaker cluster, centroid-aggregated.
/// None when the clusters carry no segments at all.
async fn cluster_embedding(
    gateway: &dyn EmbeddingGateway,
    config: &EngineConfig,
    clusters: &[Cluster],
) -> EngineResult<Option<Vec<f32>>> {
    let mut embeddings = Vec::with_capacity(clusters.len());
    let mut pending = Vec::new();
    for cluster in clusters {
        let ranges: Vec<TimeRange> = cluster
            .segments
            .iter()
            .map(|seg| TimeRange::new(seg.start_time, seg.end_time))
            .collect();
        if ranges.is_empty() {
            continue;
        }
        pending.push((cluster.row.recording_id, ranges));
    }

    use futures_util::{stream, StreamExt};
    let results: Vec<EngineResult<Vec<f32>>> = stream::iter(pending)
        .map(|(recording_id, ranges)| async move {
            gateway
                .extract(recording_id, ExtractionRequest::Ranges(ranges))
                .await
        })
        .buffer_unordered(config.max_concurrent_extractions.max(1))
        .collect()
        .await;

    for result in results {
        embeddings.push(result?);
    }

    Ok(centroid(&embeddings))
}

#[derive(Debug)]
struct VersionMoved;

impl std::fmt::Display for VersionMoved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "split origin version moved")
    }
}

impl std::error::Error for VersionMoved {}

#[derive(Debug)]
struct LinkMoved;

impl std::fmt::Display for LinkMoved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "recording speaker link moved during split")
    }
}

impl std::error::Error for LinkMoved {}
