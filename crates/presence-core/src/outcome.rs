//! Per-request outcome returned to the ingress caller.

use crate::types::{EventId, IdentityId, MatchTier, TraceId};
use serde::{Deserialize, Serialize};

/// Final state of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Logged,
    Suppressed,
    Unknown,
    NoFace,
    Error,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logged => "logged",
            Self::Suppressed => "suppressed",
            Self::Unknown => "unknown",
            Self::NoFace => "no_face",
            Self::Error => "error",
        }
    }
}

/// Structured result for one snapshot. Always carries the trace id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub trace_id: TraceId,
    pub state: TerminalState,
    pub identity: Option<IdentityId>,
    pub display_name: Option<String>,
    pub confidence: Option<f64>,
    pub distance: Option<f64>,
    pub tier: Option<MatchTier>,
    pub event_id: Option<EventId>,
    /// `false` with `state == Error` and an identity present means
    /// "recognized but not recorded".
    pub recorded: bool,
    pub reason: Option<String>,
}

impl Outcome {
    pub fn new(trace_id: TraceId, state: TerminalState) -> Self {
        Self {
            trace_id,
            state,
            identity: None,
            display_name: None,
            confidence: None,
            distance: None,
            tier: None,
            event_id: None,
            recorded: false,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn recognized_but_not_recorded(&self) -> bool {
        self.state == TerminalState::Error && self.identity.is_some() && !self.recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_json_shape() {
        let outcome = Outcome::new(TraceId::new("t-1"), TerminalState::NoFace);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["trace_id"], "t-1");
        assert_eq!(json["state"], "no_face");
        assert!(json["identity"].is_null());
        assert_eq!(json["recorded"], false);
    }

    #[test]
    fn test_recognized_but_not_recorded() {
        let mut outcome = Outcome::new(TraceId::new("t-2"), TerminalState::Error);
        assert!(!outcome.recognized_but_not_recorded());
        outcome.identity = Some(IdentityId::from("A"));
        assert!(outcome.recognized_but_not_recorded());
    }
}
