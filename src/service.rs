// Identity service
// The operation surface callers (UI, RPC layer, batch jobs) talk to.
// Wires the gateway, matcher, and engines around the shared identity graph.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::database::{DatabaseManager, GlobalSpeaker, Segment};
use crate::error::{EngineError, EngineResult};
use crate::gateway::{EmbeddingGateway, ExtractionRequest};
use crate::matcher::{rank_candidates, MatchCandidate};
use crate::merge::merge_speakers;
use crate::recalibrate::{recalibrate_speaker, training_candidates, ApprovedSegment};
use crate::resolution::{apply_resolution, unlink, ResolutionOutcome, VoiceprintAction};
use crate::scanner::{scan_library, ScanReport};
use crate::split::{split_speaker, split_unresolved, SegmentSelection, SplitOutcome};

/// Result of extracting one voiceprint.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractVoiceprintResponse {
    pub embedding_extracted: bool,
    /// Best candidate, when any cleared the weak threshold.
    pub matched_speaker: Option<MatchCandidate>,
    /// Every candidate above the weak threshold, best first.
    pub candidates: Vec<MatchCandidate>,
    /// The full registry, for the human picker.
    pub all_global_speakers: Vec<GlobalSpeaker>,
}

/// Per-label result of a batch extraction. One item failing never fails
/// the batch.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractAllItem {
    pub diarization_label: String,
    pub embedding_extracted: bool,
    pub matched_speaker: Option<MatchCandidate>,
    pub error: Option<String>,
}

/// The identity resolution engine's public face.
pub struct IdentityService {
    db: Arc<DatabaseManager>,
    gateway: Arc<dyn EmbeddingGateway>,
    config: EngineConfig,
    /// One cancellation token per in-flight scan, keyed by speaker id.
    active_scans: DashMap<i64, CancellationToken>,
}

impl IdentityService {
    pub fn new(
        db: Arc<DatabaseManager>,
        gateway: Arc<dyn EmbeddingGateway>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            db,
            gateway,
            config,
            active_scans: DashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Extract a voiceprint for one diarization label, store the snapshot,
    /// and rank it against every known identity.
    pub async fn extract_voiceprint(
        &self,
        recording_id: i64,
        label: &str,
    ) -> EngineResult<ExtractVoiceprintResponse> {
        let rs = self
            .db
            .get_recording_speaker(recording_id, label)?
            .ok_or_else(|| {
                EngineError::not_found("recording speaker", format!("{recording_id}/{label}"))
            })?;

        let embedding = self
            .gateway
            .extract(recording_id, ExtractionRequest::Label(label.to_string()))
            .await?;
        self.db.set_speaker_snapshot(rs.id, &embedding)?;

        let all_global_speakers = self.db.list_global_speakers()?;
        let candidates = rank_candidates(&embedding, &all_global_speakers, &self.config);

        Ok(ExtractVoiceprintResponse {
            embedding_extracted: true,
            matched_speaker: candidates.first().cloned(),
            candidates,
            all_global_speakers,
        })
    }

    /// Extract voiceprints for every label in a recording. Failures are
    /// per-item; the batch always completes.
    pub async fn extract_all_voiceprints(
        &self,
        recording_id: i64,
    ) -> EngineResult<Vec<ExtractAllItem>> {
        if !self.db.recording_exists(recording_id)? {
            return Err(EngineError::not_found("recording", recording_id));
        }

        let rows = self.db.list_speakers_for_recording(recording_id)?;
        let all_global_speakers = self.db.list_global_speakers()?;

        use futures_util::{stream, StreamExt};
        let gateway = self.gateway.clone();
        let extracted: Vec<(String, i64, Option<i64>, EngineResult<Vec<f32>>)> =
            stream::iter(rows)
                .map(|rs| {
                    let gateway = gateway.clone();
                    async move {
                        let request = ExtractionRequest::Label(rs.diarization_label.clone());
                        let result = gateway.extract(rs.recording_id, request).await;
                        (rs.diarization_label, rs.id, rs.global_speaker_id, result)
                    }
                })
                .buffer_unordered(self.config.max_concurrent_extractions.max(1))
                .collect()
                .await;

        let mut items = Vec::with_capacity(extracted.len());
        for (label, rs_id, linked, result) in extracted {
            match result {
                Ok(embedding) => {
                    self.db.set_speaker_snapshot(rs_id, &embedding)?;
                    // Matching only matters for rows without an identity
                    let matched_speaker = if linked.is_none() {
                        rank_candidates(&embedding, &all_global_speakers, &self.config)
                            .into_iter()
                            .next()
                    } else {
                        None
                    };
                    items.push(ExtractAllItem {
                        diarization_label: label,
                        embedding_extracted: true,
                        matched_speaker,
                        error: None,
                    });
                }
                Err(e) => {
                    log::warn!("Extraction failed for {}/{}: {}", recording_id, label, e);
                    items.push(ExtractAllItem {
                        diarization_label: label,
                        embedding_extracted: false,
                        matched_speaker: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        items.sort_by(|a, b| a.diarization_label.cmp(&b.diarization_label));
        Ok(items)
    }

    /// Apply one resolution decision to an extracted voiceprint.
    pub async fn apply_voiceprint_action(
        &self,
        recording_id: i64,
        label: &str,
        action: VoiceprintAction,
    ) -> EngineResult<ResolutionOutcome> {
        apply_resolution(&self.db, recording_id, label, action)
    }

    /// Discard a stored voiceprint snapshot.
    pub fn delete_voiceprint(&self, recording_id: i64, label: &str) -> EngineResult<()> {
        if !self.db.clear_speaker_snapshot(recording_id, label)? {
            return Err(EngineError::not_found(
                "recording speaker",
                format!("{recording_id}/{label}"),
            ));
        }
        Ok(())
    }

    /// Explicitly remove a label's identity link.
    pub fn unlink_speaker(&self, recording_id: i64, label: &str) -> EngineResult<()> {
        unlink(&self.db, recording_id, label)?;
        Ok(())
    }

    /// Merge `source_id` into `target_id`.
    pub fn merge_speakers(&self, source_id: i64, target_id: i64) -> EngineResult<GlobalSpeaker> {
        merge_speakers(&self.db, source_id, target_id)
    }

    /// Carve selected segments off an identity into a new one.
    pub async fn split_speaker(
        &self,
        speaker_id: i64,
        new_name: &str,
        selections: &[SegmentSelection],
    ) -> EngineResult<SplitOutcome> {
        split_speaker(
            &self.db,
            self.gateway.as_ref(),
            &self.config,
            speaker_id,
            new_name,
            selections,
        )
        .await
    }

    /// Promote an unresolved label into a fresh identity.
    pub async fn split_unresolved(
        &self,
        recording_id: i64,
        label: &str,
        new_name: &str,
        selections: &[SegmentSelection],
    ) -> EngineResult<SplitOutcome> {
        split_unresolved(
            &self.db,
            self.gateway.as_ref(),
            recording_id,
            label,
            new_name,
            selections,
        )
        .await
    }

    /// Rebuild an identity's reference vector from approved segments and
    /// lock it.
    pub async fn recalibrate_speaker(
        &self,
        speaker_id: i64,
        approved: &[ApprovedSegment],
    ) -> EngineResult<GlobalSpeaker> {
        recalibrate_speaker(
            &self.db,
            self.gateway.as_ref(),
            &self.config,
            speaker_id,
            approved,
        )
        .await
    }

    /// Candidate segments for recalibration review, longest first.
    pub fn training_candidates(&self, speaker_id: i64) -> EngineResult<Vec<Segment>> {
        training_candidates(&self.db, speaker_id, self.config.max_training_segments)
    }

    /// Scan the library for unlinked speakers matching this identity.
    /// Only one scan may run per identity at a time.
    pub async fn scan_matches(&self, speaker_id: i64) -> EngineResult<ScanReport> {
        let token = CancellationToken::new();
        match self.active_scans.entry(speaker_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::Conflict(format!(
                    "a scan for speaker {speaker_id} is already running"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(token.clone());
            }
        }

        let result = scan_library(
            &self.db,
            self.gateway.as_ref(),
            &self.config,
            speaker_id,
            &token,
        )
        .await;
        self.active_scans.remove(&speaker_id);
        result
    }

    /// Cancel an in-flight scan. Returns false when none is running.
    pub fn cancel_scan(&self, speaker_id: i64) -> bool {
        match self.active_scans.get(&speaker_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list_global_speakers(&self) -> EngineResult<Vec<GlobalSpeaker>> {
        Ok(self.db.list_global_speakers()?)
    }

    pub fn rename_speaker(&self, speaker_id: i64, new_name: &str) -> EngineResult<GlobalSpeaker> {
        if !self.db.rename_global_speaker(speaker_id, new_name)? {
            return Err(EngineError::not_found("global speaker", speaker_id));
        }
        self.db
            .get_global_speaker(speaker_id)?
            .ok_or_else(|| EngineError::not_found("global speaker", speaker_id))
    }

    /// Delete an identity outright, nullifying every reference to it.
    pub fn delete_global_speaker(&self, speaker_id: i64) -> EngineResult<()> {
        if !self.db.delete_global_speaker(speaker_id)? {
            return Err(EngineError::not_found("global speaker", speaker_id));
        }
        Ok(())
    }

    /// Remove identities referenced by nothing.
    pub fn prune_dangling_speakers(&self) -> EngineResult<usize> {
        Ok(self.db.prune_dangling_speakers()?)
    }
}
