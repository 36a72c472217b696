// Recalibration trainer
// Rebuilds an identity's reference vector from a human-curated segment set
// and locks it against automatic drift

use futures_util::{stream, StreamExt};

use crate::config::EngineConfig;
use crate::database::{DatabaseManager, GlobalSpeaker, Segment};
use crate::error::{EngineError, EngineResult};
use crate::gateway::{EmbeddingGateway, ExtractionRequest, TimeRange};

/// One human-approved training range.
#[derive(Debug, Clone)]
pub struct ApprovedSegment {
    pub recording_id: i64,
    pub start: f64,
    pub end: f64,
}

/// Mean of the embeddings, L2-normalized. None for an empty set.
pub(crate) fn centroid(embeddings: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = embeddings.first()?;
    let dim = first.len();
    let mut sum = vec![0.0_f32; dim];
    for embedding in embeddings {
        if embedding.len() != dim {
            return None;
        }
        for (acc, value) in sum.iter_mut().zip(embedding) {
            *acc += value;
        }
    }

    let count = embeddings.len() as f32;
    for value in sum.iter_mut() {
        *value /= count;
    }

    let norm: f32 = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in sum.iter_mut() {
            *value /= norm;
        }
    }
    Some(sum)
}

/// Extract embeddings for a set of ranges with capped gateway concurrency.
/// Returns the successful embeddings and how many extractions failed.
pub(crate) async fn extract_ranges(
    gateway: &dyn EmbeddingGateway,
    ranges: &[(i64, TimeRange)],
    max_concurrent: usize,
) -> (Vec<Vec<f32>>, usize) {
    let results: Vec<EngineResult<Vec<f32>>> = stream::iter(ranges.iter().copied())
        .map(|(recording_id, range)| async move {
            gateway
                .extract(recording_id, ExtractionRequest::Ranges(vec![range]))
                .await
        })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut embeddings = Vec::new();
    let mut failures = 0;
    for result in results {
        match result {
            Ok(embedding) => embeddings.push(embedding),
            Err(e) => {
                log::warn!("Training extraction failed: {}", e);
                failures += 1;
            }
        }
    }
    (embeddings, failures)
}

/// Rebuild a speaker's reference vector from approved segments and set
/// `locked`. Below `min_training_samples` nothing changes; individual
/// extraction failures are tolerated as long as enough samples survive.
pub async fn recalibrate_speaker(
    db: &DatabaseManager,
    gateway: &dyn EmbeddingGateway,
    config: &EngineConfig,
    speaker_id: i64,
    approved: &[ApprovedSegment],
) -> EngineResult<GlobalSpeaker> {
    if approved.len() < config.min_training_samples {
        return Err(EngineError::InsufficientSamples {
            got: approved.len(),
            need: config.min_training_samples,
        });
    }

    let speaker = db
        .get_global_speaker(speaker_id)?
        .ok_or_else(|| EngineError::not_found("global speaker", speaker_id))?;

    let ranges: Vec<(i64, TimeRange)> = approved
        .iter()
        .map(|seg| (seg.recording_id, TimeRange::new(seg.start, seg.end)))
        .collect();

    let (embeddings, failures) =
        extract_ranges(gateway, &ranges, config.max_concurrent_extractions).await;

    if embeddings.len() < config.min_training_samples {
        return Err(EngineError::ExtractionFailed(format!(
            "only {} of {} training extractions succeeded ({} failed); need {}",
            embeddings.len(),
            approved.len(),
            failures,
            config.min_training_samples
        )));
    }

    let reference = centroid(&embeddings).ok_or_else(|| {
        EngineError::ExtractionFailed("training embeddings have mismatched dimensions".to_string())
    })?;

    let updated =
        db.try_update_reference_embedding(speaker_id, &reference, speaker.version, true)?;
    if !updated {
        return Err(EngineError::Conflict(format!(
            "global speaker {speaker_id} was modified during recalibration; re-read and retry"
        )));
    }

    log::info!(
        "Recalibrated speaker '{}' ({}) from {} approved segments; vector locked",
        speaker.name,
        speaker_id,
        embeddings.len()
    );

    db.get_global_speaker(speaker_id)?
        .ok_or_else(|| EngineError::not_found("global speaker", speaker_id))
}

/// Candidate segments for the human review step, drawn from the speaker's
/// attributed segments, longest first.
pub fn training_candidates(
    db: &DatabaseManager,
    speaker_id: i64,
    limit: usize,
) -> EngineResult<Vec<Segment>> {
    if db.get_global_speaker(speaker_id)?.is_none() {
        return Err(EngineError::not_found("global speaker", speaker_id));
    }

    let mut segments = db.get_segments_for_global_speaker(speaker_id)?;
    segments.sort_by(|a, b| b.duration().total_cmp(&a.duration()));
    segments.truncate(limit);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_db, MockGateway};

    #[test]
    fn test_centroid_is_normalized_mean() {
        let embeddings = vec![vec![2.0, 0.0], vec![0.0, 2.0]];
        let center = centroid(&embeddings).unwrap();
        // Mean (1,1) normalized
        let expected = 1.0 / 2.0_f32.sqrt();
        assert!((center[0] - expected).abs() < 1e-6);
        assert!((center[1] - expected).abs() < 1e-6);

        assert!(centroid(&[]).is_none());
        assert!(centroid(&[vec![1.0], vec![1.0, 2.0]]).is_none());
    }

    #[tokio::test]
    async fn test_recalibration_locks_vector() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", Some(&[1.0, 0.0])).unwrap();
        let gateway = MockGateway::returning(vec![0.0, 1.0]);
        let config = EngineConfig::default();

        let approved = vec![
            ApprovedSegment { recording_id: 1, start: 0.0, end: 2.0 },
            ApprovedSegment { recording_id: 1, start: 4.0, end: 6.0 },
            ApprovedSegment { recording_id: 1, start: 8.0, end: 10.0 },
        ];
        let updated = recalibrate_speaker(&db, &gateway, &config, gs.id, &approved)
            .await
            .unwrap();

        assert!(updated.locked);
        assert_eq!(updated.version, gs.version + 1);
        assert_eq!(updated.embedding.unwrap(), vec![0.0, 1.0]);
        assert_eq!(gateway.call_count(), 3);
    }

    #[tokio::test]
    async fn test_insufficient_samples_leaves_state() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", Some(&[1.0, 0.0])).unwrap();
        let gateway = MockGateway::returning(vec![0.0, 1.0]);
        let config = EngineConfig::default(); // min 3

        let approved = vec![
            ApprovedSegment { recording_id: 1, start: 0.0, end: 2.0 },
            ApprovedSegment { recording_id: 1, start: 4.0, end: 6.0 },
        ];
        let err = recalibrate_speaker(&db, &gateway, &config, gs.id, &approved)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientSamples { got: 2, need: 3 }
        ));

        // Prior embedding and lock state are untouched, and the gateway
        // was never called
        let unchanged = db.get_global_speaker(gs.id).unwrap().unwrap();
        assert!(!unchanged.locked);
        assert_eq!(unchanged.embedding.unwrap(), vec![1.0, 0.0]);
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_extraction_failures_tolerated_down_to_minimum() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", None).unwrap();
        // Fails the first call, succeeds afterwards
        let gateway = MockGateway::failing_first(1, vec![0.6, 0.8]);
        let config = EngineConfig {
            min_training_samples: 3,
            max_concurrent_extractions: 1,
            ..EngineConfig::default()
        };

        let approved: Vec<ApprovedSegment> = (0..4)
            .map(|i| ApprovedSegment {
                recording_id: 1,
                start: i as f64 * 2.0,
                end: i as f64 * 2.0 + 1.0,
            })
            .collect();

        let updated = recalibrate_speaker(&db, &gateway, &config, gs.id, &approved)
            .await
            .unwrap();
        assert!(updated.locked);

        // With only the minimum requested and one failure, the whole
        // operation fails and the speaker stays unlocked
        let gs2 = db.create_global_speaker("Bea", None).unwrap();
        let gateway = MockGateway::failing_first(1, vec![0.6, 0.8]);
        let err = recalibrate_speaker(&db, &gateway, &config, gs2.id, &approved[..3])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExtractionFailed(_)));
        assert!(!db.get_global_speaker(gs2.id).unwrap().unwrap().locked);
    }

    #[tokio::test]
    async fn test_conflict_when_version_moves_mid_recalibration() {
        let (_dir, db) = seeded_db();
        let db = std::sync::Arc::new(db);
        let gs = db.create_global_speaker("Ada", None).unwrap();

        // A concurrent identity operation lands while we are extracting
        let racer = db.clone();
        let speaker_id = gs.id;
        let gateway = MockGateway::with(move |_, _| {
            let current = racer.get_global_speaker(speaker_id).unwrap().unwrap();
            racer
                .try_update_reference_embedding(speaker_id, &[0.9, 0.1], current.version, false)
                .unwrap();
            Ok(vec![0.0, 1.0])
        });

        let config = EngineConfig::default();
        let approved: Vec<ApprovedSegment> = (0..3)
            .map(|i| ApprovedSegment {
                recording_id: 1,
                start: i as f64,
                end: i as f64 + 0.5,
            })
            .collect();

        let err = recalibrate_speaker(&db, &gateway, &config, speaker_id, &approved)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // The concurrent write wins; the trainer must not clobber it
        let current = db.get_global_speaker(speaker_id).unwrap().unwrap();
        assert_eq!(current.embedding.unwrap(), vec![0.9, 0.1]);
        assert!(!current.locked);
    }

    #[test]
    fn test_training_candidates_longest_first() {
        let (_dir, db) = seeded_db();
        let gs = db.create_global_speaker("Ada", None).unwrap();
        db.add_diarization_labels(1, &["SPEAKER_00".to_string()]).unwrap();
        let rs = db.get_recording_speaker(1, "SPEAKER_00").unwrap().unwrap();
        db.set_speaker_link(rs.id, Some(gs.id)).unwrap();
        db.add_transcript_segments(
            1,
            &[
                crate::database::NewSegment {
                    diarization_label: "SPEAKER_00".to_string(),
                    start_time: 0.0,
                    end_time: 1.0,
                    text: "short".to_string(),
                },
                crate::database::NewSegment {
                    diarization_label: "SPEAKER_00".to_string(),
                    start_time: 2.0,
                    end_time: 8.0,
                    text: "long".to_string(),
                },
                crate::database::NewSegment {
                    diarization_label: "SPEAKER_00".to_string(),
                    start_time: 10.0,
                    end_time: 13.0,
                    text: "medium".to_string(),
                },
            ],
        ).unwrap();

        let candidates = training_candidates(&db, gs.id, 2).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].text, "long");
        assert_eq!(candidates[1].text, "medium");

        assert!(matches!(
            training_candidates(&db, 999, 5),
            Err(EngineError::NotFound { .. })
        ));
    }
}
