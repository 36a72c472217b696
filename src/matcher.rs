// Similarity matcher
// Ranks a candidate voiceprint against every known identity vector and
// tiers the results into strong (safe to auto-link) and weak (human review)

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::database::GlobalSpeaker;

/// Names that are diarizer artifacts rather than real identities; their
/// owners never participate in matching.
static PLACEHOLDER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(SPEAKER_\d+|Speaker \d+|Unknown|New Voice .*)$").unwrap()
});

/// Confidence tier for a match candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// At or above the strong threshold; safe for automatic linking.
    Strong,
    /// Between the thresholds; surfaced to a human, never auto-applied.
    Weak,
}

/// A ranked match against one global speaker. Ephemeral — never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub speaker_id: i64,
    pub name: String,
    /// Similarity in [0, 1].
    pub score: f32,
    pub tier: MatchTier,
}

impl MatchCandidate {
    pub fn is_strong(&self) -> bool {
        self.tier == MatchTier::Strong
    }
}

/// Cosine similarity between two embeddings, in [-1, 1].
/// Returns 0.0 for mismatched or empty vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Cosine similarity rescaled to [0, 1], the range the thresholds use.
pub fn normalized_similarity(a: &[f32], b: &[f32]) -> f32 {
    (cosine_similarity(a, b) + 1.0) / 2.0
}

/// Score a candidate embedding against a single reference vector.
/// Returns the tiered score, or None below the weak threshold.
pub fn score_against(
    embedding: &[f32],
    speaker: &GlobalSpeaker,
    config: &EngineConfig,
) -> Option<MatchCandidate> {
    let reference = speaker.embedding.as_deref()?;
    if PLACEHOLDER_NAME.is_match(&speaker.name) {
        return None;
    }

    let score = normalized_similarity(embedding, reference);
    if score < config.weak_threshold {
        return None;
    }

    let tier = if score >= config.strong_threshold {
        MatchTier::Strong
    } else {
        MatchTier::Weak
    };

    Some(MatchCandidate {
        speaker_id: speaker.id,
        name: speaker.name.clone(),
        score,
        tier,
    })
}

/// Rank a candidate embedding against every known identity, best first.
/// Speakers without a reference vector (and placeholder-named ones) are
/// skipped; an empty registry yields an empty list.
pub fn rank_candidates(
    embedding: &[f32],
    speakers: &[GlobalSpeaker],
    config: &EngineConfig,
) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = speakers
        .iter()
        .filter_map(|speaker| score_against(embedding, speaker, config))
        .collect();

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    if let Some(best) = candidates.first() {
        log::debug!(
            "Best match: '{}' (id {}) score {:.3} ({:?})",
            best.name,
            best.speaker_id,
            best.score,
            best.tier
        );
    }

    candidates
}
