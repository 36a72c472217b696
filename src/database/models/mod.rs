// Database models - Re-exports all domain-specific models
//
// Split into focused files by domain:
// - speaker.rs: Global speakers and per-recording speaker rows
// - segment.rs: Transcript segments (read-only to the engine)
// - recording.rs: Recording anchor rows

mod recording;
mod segment;
mod speaker;

pub use recording::Recording;
pub use segment::Segment;
pub use speaker::{GlobalSpeaker, RecordingSpeaker, ResolutionState};
