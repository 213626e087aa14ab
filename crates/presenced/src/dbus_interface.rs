use crate::pipeline::{Pipeline, PipelineError};
use chrono::{DateTime, NaiveDate, Utc};
use presence_core::{IdentityId, TraceId};
use presence_store::{AttendanceLedger, LedgerError};
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.presence.Attendance1";
pub const OBJECT_PATH: &str = "/org/presence/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
///
/// Every method returns a JSON document.
pub struct AttendanceService {
    pipeline: Arc<Pipeline>,
    started_at: DateTime<Utc>,
}

impl AttendanceService {
    pub fn new(pipeline: Arc<Pipeline>, started_at: DateTime<Utc>) -> Self {
        Self { pipeline, started_at }
    }

    /// Run a ledger read off the async runtime.
    async fn query<T, F>(&self, f: F) -> fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&AttendanceLedger) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = Arc::clone(self.pipeline.ledger());
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| fdo::Error::Failed(format!("ledger task failed: {e}")))?
            .map_err(ledger_error)
    }
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceService {
    /// Run one snapshot (encoded JPEG, PNG or WebP) through the pipeline.
    async fn process_snapshot(&self, image: Vec<u8>) -> fdo::Result<String> {
        let trace_id = TraceId::generate();
        tracing::debug!(trace_id = %trace_id, bytes = image.len(), "snapshot received");
        let outcome = self.pipeline.process(image, trace_id).await;
        to_json(&outcome)
    }

    /// Presence of one identity today.
    async fn status(&self, identity: &str) -> fdo::Result<String> {
        let identity = parse_identity(identity)?;
        let report = self.query(move |ledger| ledger.status(&identity)).await?;
        to_json(&report)
    }

    /// Everyone currently in the office.
    async fn present(&self) -> fdo::Result<String> {
        let present = self.query(|ledger| ledger.present()).await?;
        to_json(&present)
    }

    /// Events between two local dates (inclusive, `YYYY-MM-DD`); empty identity means everyone.
    async fn history(&self, start: &str, end: &str, identity: &str) -> fdo::Result<String> {
        let (start, end) = (parse_date(start)?, parse_date(end)?);
        let identity = (!identity.trim().is_empty()).then(|| IdentityId::new(identity.trim()));
        let entries = self
            .query(move |ledger| ledger.history(start, end, identity.as_ref())?.collect_all())
            .await?;
        to_json(&entries)
    }

    /// Hours present per identity between two local dates (inclusive).
    async fn stats(&self, start: &str, end: &str) -> fdo::Result<String> {
        let (start, end) = (parse_date(start)?, parse_date(end)?);
        let stats = self.query(move |ledger| ledger.stats(start, end)).await?;
        to_json(&stats)
    }

    /// Record an explicit exit for an enrolled identity.
    async fn record_exit(&self, identity: &str) -> fdo::Result<String> {
        let identity = parse_identity(identity)?;
        let entry = self
            .pipeline
            .record_exit(identity, TraceId::generate())
            .await
            .map_err(|e| match e {
                PipelineError::UnknownIdentity(_) => fdo::Error::InvalidArgs(e.to_string()),
                PipelineError::Ledger(e) => ledger_error(e),
                other => fdo::Error::Failed(other.to_string()),
            })?;
        to_json(&entry)
    }

    /// Daemon health and configuration summary.
    async fn health(&self) -> fdo::Result<String> {
        let roster = self.pipeline.roster();
        let events = self.query(|ledger| ledger.count()).await?;
        let present = self.query(|ledger| ledger.present()).await?.len();
        let engine = self.pipeline.engine();
        let settings = self.pipeline.settings();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": self.started_at,
            "extractor": engine.provider(),
            "model_version": engine.model_version(),
            "roster": {
                "embeddings": roster.entries.len(),
                "identities": roster.identity_count(),
                "dropped": roster.dropped,
                "loaded_at": roster.loaded_at,
            },
            "ledger_events": events,
            "office": {
                "present": present,
                "total_identities": roster.identity_count(),
            },
            "cooldown_secs": settings.cooldown.cooldown().num_seconds(),
            "extract_timeout_ms": settings.extract_timeout.as_millis() as u64,
            "workday_enforced": settings.workday.is_some(),
        })
        .to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn parse_identity(raw: &str) -> fdo::Result<IdentityId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(fdo::Error::InvalidArgs("identity must not be empty".into()));
    }
    Ok(IdentityId::new(trimmed))
}

fn parse_date(raw: &str) -> fdo::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| fdo::Error::InvalidArgs(format!("invalid date {raw:?} (expected YYYY-MM-DD): {e}")))
}

fn ledger_error(e: LedgerError) -> fdo::Error {
    match e {
        LedgerError::InvalidRange { .. }
        | LedgerError::OutOfOrder { .. }
        | LedgerError::UnknownEvent(_)
        | LedgerError::ForeignCompensation(_) => fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::error!(error = %other, "ledger failure");
            fdo::Error::Failed(other.to_string())
        }
    }
}
