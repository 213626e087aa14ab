//! Snapshot pipeline: validate, extract, match, gate, append.
//!
//! Every run ends in exactly one terminal state and carries the trace id it
//! was started with. Business outcomes (`unknown`, `suppressed`, `no_face`)
//! are normal returns; only infrastructure and configuration failures end in
//! `error`.

use crate::engine::{EngineError, EngineHandle};
use crate::ingress::{self, SnapshotRejected};
use crate::photos::PhotoArchive;
use crate::roster::Roster;
use chrono::{DateTime, Timelike, Utc};
use presence_core::{
    AttendanceEvent, Clock, CooldownGate, ExtractError, Extraction, IdentityId, MatchError, MatchTier, Matcher,
    Outcome, TerminalState, TraceId,
};
use presence_store::{AttendanceLedger, GateDecision, LedgerEntry, LedgerError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::Instrument;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("snapshot rejected: {0}")]
    Rejected(#[from] SnapshotRejected),
    #[error("extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("match failed: {0}")]
    Match(#[from] MatchError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("{0} is not enrolled")]
    UnknownIdentity(IdentityId),
    #[error("ledger task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Local hours during which entries are accepted: `[start_hour, end_hour)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkdayWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl WorkdayWindow {
    pub fn contains(&self, at: DateTime<Utc>, offset: chrono::FixedOffset) -> bool {
        let hour = at.with_timezone(&offset).hour();
        hour >= self.start_hour && hour < self.end_hour
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub extract_timeout: Duration,
    pub cooldown: CooldownGate,
    pub max_snapshot_bytes: usize,
    /// `None` accepts snapshots at any hour.
    pub workday: Option<WorkdayWindow>,
}

pub struct Pipeline {
    engine: EngineHandle,
    matcher: Box<dyn Matcher + Send + Sync>,
    roster: watch::Receiver<Arc<Roster>>,
    ledger: Arc<AttendanceLedger>,
    clock: Arc<dyn Clock>,
    photos: Option<PhotoArchive>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        engine: EngineHandle,
        matcher: Box<dyn Matcher + Send + Sync>,
        roster: watch::Receiver<Arc<Roster>>,
        ledger: Arc<AttendanceLedger>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            engine,
            matcher,
            roster,
            ledger,
            clock,
            photos: None,
            settings,
        }
    }

    pub fn with_photos(mut self, photos: PhotoArchive) -> Self {
        self.photos = Some(photos);
        self
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<AttendanceLedger> {
        &self.ledger
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Current roster snapshot.
    pub fn roster(&self) -> Arc<Roster> {
        self.roster.borrow().clone()
    }

    /// Run one snapshot to a terminal state.
    pub async fn process(&self, image: Vec<u8>, trace_id: TraceId) -> Outcome {
        let span = tracing::info_span!("snapshot", trace_id = %trace_id);
        self.run(image, trace_id).instrument(span).await
    }

    async fn run(&self, image: Vec<u8>, trace_id: TraceId) -> Outcome {
        let snapshot = match ingress::validate(&image, self.settings.max_snapshot_bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "snapshot rejected");
                return failed(trace_id, PipelineError::from(e));
            }
        };
        tracing::debug!(format = ?snapshot.format, dimensions = ?snapshot.dimensions, "snapshot accepted");
        let kept_bytes = self.photos.as_ref().map(|_| image.clone());

        let extraction = match self.extract(image).await {
            Ok(extraction) => extraction,
            Err(PipelineError::Engine(EngineError::Extract(ExtractError::NoFace))) => {
                tracing::debug!("no face in snapshot");
                return Outcome::new(trace_id, TerminalState::NoFace);
            }
            Err(e) => {
                tracing::warn!(error = %e, "extraction failed");
                return failed(trace_id, e);
            }
        };

        let roster = self.roster();
        let at = self.clock.now();
        let result = match self.matcher.compare(&extraction.embedding, &roster.entries, at) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "match rejected; check enrollment and extractor configuration");
                return failed(trace_id, PipelineError::from(e));
            }
        };

        let mut outcome = Outcome::new(trace_id.clone(), TerminalState::Unknown);
        outcome.distance = result.distance;
        outcome.tier = Some(result.tier);

        let candidate = match (&result.candidate, result.tier) {
            (Some(candidate), MatchTier::Match | MatchTier::LowConfidence) => candidate.clone(),
            _ => {
                let reason = if result.distance.is_none() {
                    "empty_roster"
                } else if result.ambiguous {
                    "ambiguous"
                } else {
                    "no_match"
                };
                tracing::info!(distance = ?result.distance, reason, "face not recognized");
                return outcome.with_reason(reason);
            }
        };

        outcome.identity = Some(candidate.id.clone());
        outcome.display_name = Some(candidate.display_name.clone());
        outcome.confidence = result.confidence();
        if result.tier == MatchTier::LowConfidence {
            tracing::warn!(
                identity = %candidate.id,
                distance = ?result.distance,
                quality = extraction.quality,
                "low-confidence match"
            );
        }

        if let Some(window) = self.settings.workday {
            if !window.contains(at, self.ledger.offset()) {
                tracing::info!(identity = %candidate.id, "snapshot outside work-day window");
                outcome.state = TerminalState::Suppressed;
                return outcome.with_reason("outside_workday");
            }
        }

        let confidence = outcome.confidence.unwrap_or(0.0);
        let mut event = AttendanceEvent::entry(candidate.id.clone(), at, confidence, trace_id.clone());
        let photo_ref = self
            .photos
            .as_ref()
            .map(|photos| photos.reference_for(&trace_id, at, snapshot.extension()));
        if let Some(reference) = &photo_ref {
            event = event.with_photo(reference.clone());
        }

        let ledger = Arc::clone(&self.ledger);
        let gate = self.settings.cooldown;
        let decision = tokio::task::spawn_blocking(move || ledger.append_gated(&event, &gate))
            .await
            .map_err(PipelineError::from)
            .and_then(|r| r.map_err(PipelineError::from));

        match decision {
            Ok(GateDecision::Appended(event_id)) => {
                outcome.state = TerminalState::Logged;
                outcome.recorded = true;
                outcome.event_id = Some(event_id);
                tracing::info!(
                    identity = %candidate.id,
                    event_id = %event_id,
                    confidence,
                    tier = result.tier.as_str(),
                    "entry logged"
                );
                if let (Some(photos), Some(reference), Some(bytes)) = (&self.photos, photo_ref, kept_bytes) {
                    self.save_photo(photos.clone(), reference, bytes).await;
                }
                outcome
            }
            Ok(GateDecision::Suppressed { last_event_at }) => {
                tracing::info!(identity = %candidate.id, %last_event_at, "entry suppressed by cooldown");
                outcome.state = TerminalState::Suppressed;
                outcome.with_reason("cooldown")
            }
            Err(e) => {
                tracing::error!(identity = %candidate.id, error = %e, "recognized but not recorded");
                outcome.state = TerminalState::Error;
                outcome.with_reason(format!("recognized but not recorded: {e}"))
            }
        }
    }

    async fn extract(&self, image: Vec<u8>) -> Result<Extraction, PipelineError> {
        let timeout = self.settings.extract_timeout;
        match tokio::time::timeout(timeout, self.engine.extract(image)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PipelineError::ExtractionTimeout(timeout)),
        }
    }

    async fn save_photo(&self, photos: PhotoArchive, reference: String, bytes: Vec<u8>) {
        let saved = tokio::task::spawn_blocking(move || photos.save(&reference, &bytes)).await;
        match saved {
            Ok(Ok(path)) => tracing::debug!(path = %path.display(), "debug photo saved"),
            Ok(Err(e)) => tracing::warn!(error = %e, "debug photo not saved"),
            Err(e) => tracing::warn!(error = %e, "debug photo task failed"),
        }
    }

    /// Append an explicit exit for an enrolled identity.
    pub async fn record_exit(&self, identity: IdentityId, trace_id: TraceId) -> Result<LedgerEntry, PipelineError> {
        let span = tracing::info_span!("exit", trace_id = %trace_id);
        async {
            if self.roster().display_name(&identity).is_none() {
                return Err(PipelineError::UnknownIdentity(identity));
            }
            let ledger = Arc::clone(&self.ledger);
            let entry = tokio::task::spawn_blocking(move || ledger.record_exit(&identity, trace_id)).await??;
            tracing::info!(event_id = %entry.id, "exit recorded");
            Ok(entry)
        }
        .instrument(span)
        .await
    }
}

fn failed(trace_id: TraceId, error: PipelineError) -> Outcome {
    Outcome::new(trace_id, TerminalState::Error).with_reason(error.to_string())
}
