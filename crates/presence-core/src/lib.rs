//! Matching and gating logic for the attendance pipeline.
//!
//! Compares a freshly extracted face embedding against the enrolled roster,
//! classifies the match, and decides whether a new attendance event may be
//! recorded. Embedding extraction is a pluggable capability (mock or ONNX).

pub mod clock;
pub mod cooldown;
pub mod extractor;
pub mod matcher;
pub mod onnx;
pub mod outcome;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::{CooldownGate, LatestEventView};
pub use extractor::{EmbeddingExtractor, ExtractError, Extraction, ExtractorKind, MockExtractor};
pub use matcher::{EuclideanMatcher, MatchError, Matcher};
pub use outcome::{Outcome, TerminalState};
pub use types::{
    AttendanceEvent, Embedding, EnrolledEmbedding, EventId, EventType, Identity, IdentityId, MatchResult,
    MatchTier, PresenceStatus, TraceId,
};
