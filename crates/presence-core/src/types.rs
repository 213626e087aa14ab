use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable employee key as issued by the enrollment store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// An enrolled person. Owned by the enrollment store; the core only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: IdentityId::new(id),
            display_name: display_name.into(),
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace, 128 for dlib-style models).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    /// Embedding without a recorded model version.
    pub fn unversioned(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance, accumulated in `f64`.
    ///
    /// Callers must check dimensions first; extra components of the longer
    /// vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| {
                let d = f64::from(a) - f64::from(b);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }
}

/// One roster entry. An identity may own several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledEmbedding {
    pub identity: Identity,
    pub embedding: Embedding,
}

/// Confidence tier assigned to the nearest roster neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Match,
    LowConfidence,
    Unknown,
}

impl MatchTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::LowConfidence => "low_confidence",
            Self::Unknown => "unknown",
        }
    }
}

/// Result of matching a query embedding against a roster. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Asserted identity; `None` for `unknown` and for ambiguous results.
    pub candidate: Option<Identity>,
    /// Distance to the nearest roster entry; `None` when the roster was empty.
    pub distance: Option<f64>,
    pub tier: MatchTier,
    /// Two or more identities were equidistant from the query.
    pub ambiguous: bool,
    pub timestamp: DateTime<Utc>,
}

impl MatchResult {
    pub fn empty_roster(timestamp: DateTime<Utc>) -> Self {
        Self {
            candidate: None,
            distance: None,
            tier: MatchTier::Unknown,
            ambiguous: false,
            timestamp,
        }
    }

    /// `1 - distance` clamped to [0, 1], reported only for `match` and `low_confidence`.
    pub fn confidence(&self) -> Option<f64> {
        match self.tier {
            MatchTier::Unknown => None,
            _ => self.distance.map(|d| (1.0 - d).clamp(0.0, 1.0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Entry,
    Exit,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(Self::Entry),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Ledger-assigned, monotonically increasing event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id generated once at ingress and carried into the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An attendance fact. Immutable once appended; corrections are new events
/// that reference the event they compensate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity: Option<IdentityId>,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub trace_id: TraceId,
    pub photo_ref: Option<String>,
    pub compensates: Option<EventId>,
}

impl AttendanceEvent {
    pub fn entry(identity: IdentityId, timestamp: DateTime<Utc>, confidence: f64, trace_id: TraceId) -> Self {
        Self {
            identity: Some(identity),
            event_type: EventType::Entry,
            timestamp,
            confidence,
            trace_id,
            photo_ref: None,
            compensates: None,
        }
    }

    /// Explicit exit. Exits are declared, not recognised, so confidence is 1.0.
    pub fn exit(identity: IdentityId, timestamp: DateTime<Utc>, trace_id: TraceId) -> Self {
        Self {
            identity: Some(identity),
            event_type: EventType::Exit,
            timestamp,
            confidence: 1.0,
            trace_id,
            photo_ref: None,
            compensates: None,
        }
    }

    pub fn with_photo(mut self, photo_ref: impl Into<String>) -> Self {
        self.photo_ref = Some(photo_ref.into());
        self
    }

    pub fn compensating(mut self, event: EventId) -> Self {
        self.compensates = Some(event);
        self
    }
}

/// Presence derived from the latest event today. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    InOffice,
    Left,
    Unknown,
}

impl PresenceStatus {
    pub fn from_latest(event_type: Option<EventType>) -> Self {
        match event_type {
            Some(EventType::Entry) => Self::InOffice,
            Some(EventType::Exit) => Self::Left,
            None => Self::Unknown,
        }
    }
}
