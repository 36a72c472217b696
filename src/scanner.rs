// Library scanner
// Re-applies similarity matching across every unlinked recording speaker
// after an identity's reference vector changes (recalibration or split).
// Strong matches auto-link; weak matches are only reported.

use std::collections::HashSet;

use futures_util::{stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::database::{DatabaseManager, RecordingSpeaker};
use crate::error::{EngineError, EngineResult};
use crate::gateway::{EmbeddingGateway, ExtractionRequest};
use crate::matcher::normalized_similarity;

/// A below-strong match surfaced for human review.
#[derive(Debug, Clone, Serialize)]
pub struct WeakMatch {
    pub recording_id: i64,
    pub diarization_label: String,
    pub score: f32,
}

/// Outcome of one library scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Strong matches that were auto-linked.
    pub matches_found: usize,
    /// Distinct recordings whose speakers got linked.
    pub recordings_updated: usize,
    /// Weak matches reported but never applied.
    pub weak_matches: Vec<WeakMatch>,
    /// Rows skipped because extraction failed.
    pub skipped_failures: usize,
    /// True when the scan stopped early on cancellation.
    pub cancelled: bool,
}

/// Scan the library for unlinked speakers matching `speaker_id`'s
/// reference vector.
///
/// Each auto-link is its own atomic, conditional step: rows linked by
/// someone else mid-scan are skipped rather than overwritten, so an
/// interrupted scan never leaves the graph inconsistent. Re-running after
/// no further changes finds zero new matches.
pub async fn scan_library(
    db: &DatabaseManager,
    gateway: &dyn EmbeddingGateway,
    config: &EngineConfig,
    speaker_id: i64,
    cancel: &CancellationToken,
) -> EngineResult<ScanReport> {
    let speaker = db
        .get_global_speaker(speaker_id)?
        .ok_or_else(|| EngineError::not_found("global speaker", speaker_id))?;
    let reference = speaker.embedding.as_deref().ok_or_else(|| {
        EngineError::InvalidArgument(format!(
            "global speaker {speaker_id} has no reference embedding to scan with"
        ))
    })?;

    let unlinked = db.list_unlinked_speakers()?;
    log::info!(
        "Scanning {} unlinked speakers against '{}' ({})",
        unlinked.len(),
        speaker.name,
        speaker_id
    );

    let mut report = ScanReport::default();

    // First pass: fill in missing snapshots with capped-concurrency
    // extraction. Failures are per-item, never fatal to the scan.
    let (with_snapshot, without): (Vec<RecordingSpeaker>, Vec<RecordingSpeaker>) =
        unlinked.into_iter().partition(|rs| rs.embedding.is_some());

    let mut candidates = with_snapshot;
    if !without.is_empty() && !cancel.is_cancelled() {
        let extracted: Vec<(RecordingSpeaker, EngineResult<Vec<f32>>)> = stream::iter(without)
            .map(|rs| async move {
                let request = ExtractionRequest::Label(rs.diarization_label.clone());
                let result = gateway.extract(rs.recording_id, request).await;
                (rs, result)
            })
            .buffer_unordered(config.max_concurrent_extractions.max(1))
            .collect()
            .await;

        for (mut rs, result) in extracted {
            match result {
                Ok(embedding) => {
                    db.set_speaker_snapshot(rs.id, &embedding)?;
                    rs.embedding = Some(embedding);
                    candidates.push(rs);
                }
                Err(e) => {
                    log::warn!(
                        "Skipping {}/{}: {}",
                        rs.recording_id, rs.diarization_label, e
                    );
                    report.skipped_failures += 1;
                }
            }
        }
    }

    // Second pass: score and link, one atomic step per row.
    let mut updated_recordings: HashSet<i64> = HashSet::new();
    for rs in candidates {
        if cancel.is_cancelled() {
            report.cancelled = true;
            log::info!("Scan for speaker {} cancelled", speaker_id);
            break;
        }

        let embedding = match rs.embedding.as_deref() {
            Some(e) => e,
            None => continue,
        };
        let score = normalized_similarity(embedding, reference);

        if score >= config.strong_threshold {
            // Conditional: skip if someone linked this row mid-scan.
            if db.try_link_if_unlinked(rs.id, speaker_id)? {
                log::debug!(
                    "Auto-linked {}/{} to speaker {} (score {:.3})",
                    rs.recording_id, rs.diarization_label, speaker_id, score
                );
                report.matches_found += 1;
                updated_recordings.insert(rs.recording_id);
            }
        } else if score >= config.weak_threshold {
            report.weak_matches.push(WeakMatch {
                recording_id: rs.recording_id,
                diarization_label: rs.diarization_label,
                score,
            });
        }
    }

    report.recordings_updated = updated_recordings.len();
    log::info!(
        "Scan complete for speaker {}: {} linked across {} recordings, {} weak, {} skipped",
        speaker_id,
        report.matches_found,
        report.recordings_updated,
        report.weak_matches.len(),
        report.skipped_failures
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_db, MockGateway};

    fn unlinked_with_snapshot(db: &DatabaseManager, rec: i64, label: &str, snapshot: &[f32]) {
        db.add_diarization_labels(rec, &[label.to_string()]).unwrap();
        let rs = db.get_recording_speaker(rec, label).unwrap().unwrap();
        db.set_speaker_snapshot(rs.id, snapshot).unwrap();
    }

    #[tokio::test]
    async fn test_strong_matches_auto_link() {
        let (_dir, db) = seeded_db();
        db.create_recording(2, "b").unwrap();
        let gs = db.create_global_speaker("Ada", Some(&[1.0, 0.0])).unwrap();

        unlinked_with_snapshot(&db, 1, "SPEAKER_00", &[1.0, 0.0]); // identical
        unlinked_with_snapshot(&db, 2, "SPEAKER_01", &[0.99, 0.05]); // near
        unlinked_with_snapshot(&db, 2, "SPEAKER_02", &[-1.0, 0.0]); // opposite

        let gateway = MockGateway::unavailable(); // snapshots suffice
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();

        let report = scan_library(&db, &gateway, &config, gs.id, &cancel)
            .await
            .unwrap();

        assert_eq!(report.matches_found, 2);
        assert_eq!(report.recordings_updated, 2);
        assert_eq!(gateway.call_count(), 0);

        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        assert_eq!(rs.global_speaker_id, Some(gs.id));
        let rs = db.get_recording_speaker(2, "SPEAKER_02").unwrap().unwrap();
        assert_eq!(rs.global_speaker_id, None);
    }

    #[tokio::test]
    async fn test_weak_matches_reported_not_applied() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", Some(&[1.0, 0.0])).unwrap();
        // cos = 0.2 -> normalized 0.6: between weak (0.5) and strong (0.8)
        unlinked_with_snapshot(&db, 1, "SPEAKER_00", &[0.2, 0.9797959]);

        let gateway = MockGateway::unavailable();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();

        let report = scan_library(&db, &gateway, &config, gs.id, &cancel)
            .await
            .unwrap();

        assert_eq!(report.matches_found, 0);
        assert_eq!(report.weak_matches.len(), 1);
        assert!(report.weak_matches[0].score > 0.5 && report.weak_matches[0].score < 0.8);
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        assert_eq!(rs.global_speaker_id, None);
    }

    #[tokio::test]
    async fn test_scan_is_idempotent() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", Some(&[1.0, 0.0])).unwrap();
        unlinked_with_snapshot(&db, 1, "SPEAKER_00", &[1.0, 0.0]);

        let gateway = MockGateway::unavailable();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();

        let first = scan_library(&db, &gateway, &config, gs.id, &cancel)
            .await
            .unwrap();
        assert_eq!(first.matches_found, 1);

        let second = scan_library(&db, &gateway, &config, gs.id, &cancel)
            .await
            .unwrap();
        assert_eq!(second.matches_found, 0);
        assert_eq!(second.recordings_updated, 0);
    }

    #[tokio::test]
    async fn test_fresh_extraction_fills_missing_snapshots() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", Some(&[1.0, 0.0])).unwrap();
        db.add_diarization_labels(1, &["SPEAKER_00".to_string()]).unwrap();

        let gateway = MockGateway::returning(vec![1.0, 0.0]);
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();

        let report = scan_library(&db, &gateway, &config, gs.id, &cancel)
            .await
            .unwrap();

        assert_eq!(report.matches_found, 1);
        assert_eq!(gateway.call_count(), 1);
        // The fresh snapshot is persisted for later scans
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        assert_eq!(rs.embedding.unwrap(), vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_per_item_extraction_failures_skip() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", Some(&[1.0, 0.0])).unwrap();
        db.add_diarization_labels(
            1,
            &["SPEAKER_00".to_string(), "SPEAKER_01".to_string()],
        ).unwrap();

        let gateway = MockGateway::failing_first(1, vec![1.0, 0.0]);
        let config = EngineConfig {
            max_concurrent_extractions: 1,
            ..EngineConfig::default()
        };
        let cancel = CancellationToken::new();

        let report = scan_library(&db, &gateway, &config, gs.id, &cancel)
            .await
            .unwrap();

        assert_eq!(report.skipped_failures, 1);
        assert_eq!(report.matches_found, 1);
    }

    #[tokio::test]
    async fn test_cancelled_scan_stops_cleanly() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", Some(&[1.0, 0.0])).unwrap();
        unlinked_with_snapshot(&db, 1, "SPEAKER_00", &[1.0, 0.0]);
        unlinked_with_snapshot(&db, 1, "SPEAKER_01", &[1.0, 0.0]);

        let gateway = MockGateway::unavailable();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scan_library(&db, &gateway, &config, gs.id, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.matches_found, 0);
        // Nothing half-linked
        for rs in db.list_speakers_for_recording(1).unwrap() {
            assert_eq!(rs.global_speaker_id, None);
        }
    }

    #[tokio::test]
    async fn test_scan_requires_reference_embedding() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", None).unwrap();
        let gateway = MockGateway::unavailable();
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();

        let err = scan_library(&db, &gateway, &config, gs.id, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
