// voicegraph
// Cross-recording speaker identity resolution: voiceprint extraction,
// similarity matching, and the merge/split/recalibrate engines around a
// persistent identity graph.

pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod matcher;
pub mod merge;
pub mod recalibrate;
pub mod resolution;
pub mod scanner;
pub mod service;
pub mod split;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use database::{
    DatabaseManager, GlobalSpeaker, NewSegment, Recording, RecordingSpeaker, ResolutionState,
    Segment,
};
pub use error::{EngineError, EngineResult};
pub use gateway::{EmbeddingGateway, ExtractionRequest, TimeRange};
pub use matcher::{MatchCandidate, MatchTier};
pub use recalibrate::ApprovedSegment;
pub use resolution::{ResolutionOutcome, VoiceprintAction};
pub use scanner::{ScanReport, WeakMatch};
pub use service::{ExtractAllItem, ExtractVoiceprintResponse, IdentityService};
pub use split::{SegmentSelection, SplitOutcome};
