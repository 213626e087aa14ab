//! Append-only attendance ledger on SQLite.
//!
//! One connection behind a mutex. Every write runs in a `BEGIN IMMEDIATE`
//! transaction so the check-then-append in [`AttendanceLedger::append_gated`]
//! is atomic against other threads and other processes sharing the file.
//! Schema triggers reject any UPDATE or DELETE on the events table.

use crate::history::History;
use crate::stats::{self, IdentityStats};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, Utc};
use presence_core::{
    AttendanceEvent, Clock, CooldownGate, EventId, EventType, IdentityId, LatestEventView, PresenceStatus,
    TraceId,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create ledger directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("event for {identity} at {at} precedes its latest event at {latest}")]
    OutOfOrder {
        identity: IdentityId,
        at: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
    #[error("compensated event {0} does not exist")]
    UnknownEvent(EventId),
    #[error("compensated event {0} belongs to another identity")]
    ForeignCompensation(EventId),
    #[error("gated append needs an identity")]
    MissingIdentity,
    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("ledger lock poisoned")]
    Poisoned,
}

/// A stored event with its ledger id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EventId,
    #[serde(flatten)]
    pub event: AttendanceEvent,
}

/// Result of a cooldown-gated append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Appended(EventId),
    Suppressed { last_event_at: DateTime<Utc> },
}

/// Presence of one identity, derived from the ledger on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub identity: IdentityId,
    pub status: PresenceStatus,
    /// Latest event overall, which may predate today.
    pub last_event: Option<EventType>,
    pub last_event_at: Option<DateTime<Utc>>,
}

const SELECT_COLUMNS: &str =
    "SELECT id, identity, event_type, timestamp, confidence, trace_id, photo_ref, compensates FROM attendance_events";

pub struct AttendanceLedger {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl AttendanceLedger {
    /// Open (or create) the ledger database at `path`.
    ///
    /// `offset` is the office's UTC offset; it defines "today" and the
    /// day boundaries of history and stats ranges.
    pub fn open(path: &Path, clock: Arc<dyn Clock>, offset: FixedOffset) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        tracing::info!(path = %path.display(), "attendance ledger opened");
        Self::with_connection(conn, clock, offset)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>, offset: FixedOffset) -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::with_connection(conn, clock, offset)
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>, offset: FixedOffset) -> Result<Self, LedgerError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            offset,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Current date in office local time.
    pub fn today(&self) -> NaiveDate {
        local_date(self.clock.now(), self.offset)
    }

    /// Append an event. Never overwrites or reorders prior events.
    ///
    /// Regular events must not precede the identity's latest event;
    /// compensating events may be backdated but must reference an existing
    /// event.
    pub fn append(&self, event: &AttendanceEvent) -> Result<EventId, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = insert_checked(&tx, event, self.clock.now())?;
        tx.commit()?;
        Ok(id)
    }

    /// Append only if the cooldown gate permits it, atomically.
    ///
    /// The latest-event read and the insert share one immediate
    /// transaction under the connection lock, so concurrent triggers for the
    /// same identity cannot both pass the gate.
    pub fn append_gated(&self, event: &AttendanceEvent, gate: &CooldownGate) -> Result<GateDecision, LedgerError> {
        let identity = event.identity.as_ref().ok_or(LedgerError::MissingIdentity)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let last_event_at = latest_in(&tx, identity)?.map(|e| e.event.timestamp);

        if !gate.permits(last_event_at, event.timestamp) {
            if let Some(last_event_at) = last_event_at {
                return Ok(GateDecision::Suppressed { last_event_at });
            }
        }

        let id = insert_checked(&tx, event, self.clock.now())?;
        tx.commit()?;
        Ok(GateDecision::Appended(id))
    }

    /// Explicit exit at the current clock time. Not subject to cooldown.
    pub fn record_exit(&self, identity: &IdentityId, trace_id: TraceId) -> Result<LedgerEntry, LedgerError> {
        let event = AttendanceEvent::exit(identity.clone(), self.clock.now(), trace_id);
        let id = self.append(&event)?;
        Ok(LedgerEntry { id, event })
    }

    pub fn get(&self, id: EventId) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![id.0], read_entry)
            .optional()?;
        Ok(entry)
    }

    /// Most recent event for `identity`, by timestamp then insertion order.
    pub fn latest_event(&self, identity: &IdentityId) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.conn()?;
        latest_in(&conn, identity)
    }

    /// Read-only cooldown check at the current clock time.
    pub fn can_log_entry(&self, identity: &IdentityId, gate: &CooldownGate) -> Result<bool, LedgerError> {
        gate.can_log_entry(self, identity, self.clock.now())
    }

    /// `in_office` / `left` from the latest event today, `unknown` if none.
    ///
    /// Events stamped after today (a clock that ran ahead) do not count.
    pub fn status(&self, identity: &IdentityId) -> Result<StatusReport, LedgerError> {
        let today = self.today();
        let (day_start, day_end) = self.range_bounds(today, today)?;
        let conn = self.conn()?;
        let latest = latest_in(&conn, identity)?;
        let today = conn
            .query_row(
                &format!(
                    "{SELECT_COLUMNS} WHERE identity = ?1 AND timestamp >= ?2 AND timestamp < ?3
                     ORDER BY timestamp DESC, id DESC LIMIT 1"
                ),
                params![identity.as_str(), encode_ts(day_start), encode_ts(day_end)],
                read_entry,
            )
            .optional()?
            .map(|e| e.event.event_type);

        Ok(StatusReport {
            identity: identity.clone(),
            status: PresenceStatus::from_latest(today),
            last_event: latest.as_ref().map(|e| e.event.event_type),
            last_event_at: latest.map(|e| e.event.timestamp),
        })
    }

    /// Everyone whose latest event is today's `entry`.
    pub fn present(&self) -> Result<Vec<StatusReport>, LedgerError> {
        let today = self.today();
        let (day_start, day_end) = self.range_bounds(today, today)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} AS e
             WHERE e.identity IS NOT NULL
               AND e.timestamp >= ?1 AND e.timestamp < ?2
               AND e.event_type = 'entry'
               AND e.id = (SELECT l.id FROM attendance_events l
                           WHERE l.identity = e.identity
                             AND l.timestamp >= ?1 AND l.timestamp < ?2
                           ORDER BY l.timestamp DESC, l.id DESC LIMIT 1)
             ORDER BY e.timestamp, e.id"
        ))?;

        let rows = stmt.query_map(params![encode_ts(day_start), encode_ts(day_end)], read_entry)?;
        let mut present = Vec::new();
        for row in rows {
            let entry = row?;
            if let Some(identity) = entry.event.identity {
                present.push(StatusReport {
                    identity,
                    status: PresenceStatus::InOffice,
                    last_event: Some(EventType::Entry),
                    last_event_at: Some(entry.event.timestamp),
                });
            }
        }
        Ok(present)
    }

    /// Events within the inclusive local-date range, oldest first.
    ///
    /// The returned handle is lazy: rows are fetched page by page while
    /// iterating, and it can be iterated again from the start.
    pub fn history(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        identity: Option<&IdentityId>,
    ) -> Result<History<'_>, LedgerError> {
        let (from, until) = self.range_bounds(start, end)?;
        Ok(History::new(self, from, until, identity.cloned()))
    }

    /// Hours present per identity over the inclusive local-date range.
    ///
    /// Open sessions are counted up to `min(now, end of range)`.
    pub fn stats(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<IdentityStats>, LedgerError> {
        let (from, until) = self.range_bounds(start, end)?;
        let horizon = self.clock.now().min(until);

        let mut per_identity: BTreeMap<IdentityId, Vec<AttendanceEvent>> = BTreeMap::new();
        for entry in History::new(self, from, until, None).iter() {
            let entry = entry?;
            if let Some(identity) = entry.event.identity.clone() {
                per_identity.entry(identity).or_default().push(entry.event);
            }
        }

        Ok(per_identity
            .into_iter()
            .map(|(identity, events)| stats::summarize(identity, &events, horizon, self.offset))
            .collect())
    }

    /// Number of stored events.
    pub fn count(&self) -> Result<u64, LedgerError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM attendance_events", [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    fn range_bounds(&self, start: NaiveDate, end: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>), LedgerError> {
        if start > end {
            return Err(LedgerError::InvalidRange { start, end });
        }
        let next_day = end.succ_opt().ok_or(LedgerError::InvalidRange { start, end })?;
        Ok((local_midnight(start, self.offset), local_midnight(next_day, self.offset)))
    }

    /// One page of the ordered event stream, strictly after `cursor`.
    pub(crate) fn page(
        &self,
        from: &str,
        until: &str,
        identity: Option<&str>,
        cursor: Option<&(String, i64)>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{SELECT_COLUMNS}
             WHERE timestamp >= ?1 AND timestamp < ?2
               AND (?3 IS NULL OR identity = ?3)
               AND (?4 IS NULL OR timestamp > ?4 OR (timestamp = ?4 AND id > ?5))
             ORDER BY timestamp, id
             LIMIT ?6"
        ))?;

        let rows = stmt.query_map(
            params![
                from,
                until,
                identity,
                cursor.map(|c| c.0.as_str()),
                cursor.map(|c| c.1).unwrap_or(0),
                i64::try_from(limit).unwrap_or(i64::MAX),
            ],
            read_entry,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl LatestEventView for AttendanceLedger {
    type Error = LedgerError;

    fn latest_event_at(&self, identity: &IdentityId) -> Result<Option<DateTime<Utc>>, LedgerError> {
        Ok(self.latest_event(identity)?.map(|e| e.event.timestamp))
    }
}

fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS attendance_events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            identity    TEXT,
            event_type  TEXT NOT NULL CHECK (event_type IN ('entry', 'exit')),
            timestamp   TEXT NOT NULL,
            confidence  REAL NOT NULL,
            trace_id    TEXT NOT NULL,
            photo_ref   TEXT,
            compensates INTEGER REFERENCES attendance_events(id),
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_identity_ts ON attendance_events(identity, timestamp, id);
        CREATE INDEX IF NOT EXISTS idx_events_ts ON attendance_events(timestamp, id);
        CREATE INDEX IF NOT EXISTS idx_events_trace ON attendance_events(trace_id);
        CREATE TRIGGER IF NOT EXISTS attendance_events_no_update
            BEFORE UPDATE ON attendance_events
            BEGIN SELECT RAISE(ABORT, 'attendance ledger is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS attendance_events_no_delete
            BEFORE DELETE ON attendance_events
            BEGIN SELECT RAISE(ABORT, 'attendance ledger is append-only'); END;",
    )?;
    Ok(())
}

fn latest_in(conn: &Connection, identity: &IdentityId) -> Result<Option<LedgerEntry>, LedgerError> {
    let entry = conn
        .query_row(
            &format!("{SELECT_COLUMNS} WHERE identity = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1"),
            params![identity.as_str()],
            read_entry,
        )
        .optional()?;
    Ok(entry)
}

fn insert_checked(conn: &Connection, event: &AttendanceEvent, recorded_at: DateTime<Utc>) -> Result<EventId, LedgerError> {
    if let Some(target) = event.compensates {
        let owner: Option<String> = conn
            .query_row(
                "SELECT identity FROM attendance_events WHERE id = ?1",
                params![target.0],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(LedgerError::UnknownEvent(target))?;
        if owner.as_deref() != event.identity.as_ref().map(|i| i.as_str()) {
            return Err(LedgerError::ForeignCompensation(target));
        }
    } else if let Some(identity) = &event.identity {
        if let Some(latest) = latest_in(conn, identity)? {
            if event.timestamp < latest.event.timestamp {
                return Err(LedgerError::OutOfOrder {
                    identity: identity.clone(),
                    at: event.timestamp,
                    latest: latest.event.timestamp,
                });
            }
        }
    }

    conn.execute(
        "INSERT INTO attendance_events
            (identity, event_type, timestamp, confidence, trace_id, photo_ref, compensates, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.identity.as_ref().map(|i| i.as_str()),
            event.event_type.as_str(),
            encode_ts(event.timestamp),
            event.confidence,
            event.trace_id.as_str(),
            event.photo_ref,
            event.compensates.map(|id| id.0),
            encode_ts(recorded_at),
        ],
    )?;

    let id = EventId(conn.last_insert_rowid());
    tracing::debug!(
        event_id = %id,
        identity = event.identity.as_ref().map(|i| i.as_str()),
        event_type = event.event_type.as_str(),
        trace_id = %event.trace_id,
        "attendance event appended"
    );
    Ok(id)
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let event_type: String = row.get(2)?;
    let event_type =
        EventType::parse(&event_type).ok_or_else(|| conversion_error(2, format!("unknown event type {event_type:?}")))?;
    let timestamp: String = row.get(3)?;
    let timestamp = decode_ts(&timestamp).map_err(|e| conversion_error(3, e.to_string()))?;

    Ok(LedgerEntry {
        id: EventId(row.get(0)?),
        event: AttendanceEvent {
            identity: row.get::<_, Option<String>>(1)?.map(IdentityId::new),
            event_type,
            timestamp,
            confidence: row.get(4)?,
            trace_id: TraceId::new(row.get::<_, String>(5)?),
            photo_ref: row.get(6)?,
            compensates: row.get::<_, Option<i64>>(7)?.map(EventId),
        },
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

/// Fixed-width RFC 3339 UTC text; lexical order equals time order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}

/// UTC instant of local midnight starting `date`.
pub(crate) fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    let utc = local - chrono::Duration::seconds(i64::from(offset.local_minus_utc()));
    DateTime::from_naive_utc_and_offset(utc, Utc)
}

pub(crate) fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use presence_core::ManualClock;
    use std::sync::Barrier;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn ledger_at(now: &str) -> (AttendanceLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(ts(now)));
        let ledger = AttendanceLedger::open_in_memory(clock.clone(), utc()).unwrap();
        (ledger, clock)
    }

    fn entry(id: &str, at: &str) -> AttendanceEvent {
        AttendanceEvent::entry(IdentityId::from(id), ts(at), 0.9, TraceId::generate())
    }

    fn exit(id: &str, at: &str) -> AttendanceEvent {
        AttendanceEvent::exit(IdentityId::from(id), ts(at), TraceId::generate())
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        let a = ledger.append(&entry("A", "2026-01-01T08:00:00Z")).unwrap();
        let b = ledger.append(&entry("B", "2026-01-01T08:01:00Z")).unwrap();
        assert!(b > a);
        assert_eq!(ledger.count().unwrap(), 2);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        let event = entry("A", "2026-01-01T08:00:00.123456Z").with_photo("2026-01-01/t.jpg");
        let id = ledger.append(&event).unwrap();
        let stored = ledger.get(id).unwrap().unwrap();
        assert_eq!(stored.event, event);
    }

    #[test]
    fn test_status_unknown_without_events() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        let report = ledger.status(&IdentityId::from("A")).unwrap();
        assert_eq!(report.status, PresenceStatus::Unknown);
        assert!(report.last_event.is_none());
    }

    #[test]
    fn test_status_entry_then_exit_is_left() {
        let (ledger, _) = ledger_at("2026-01-01T19:00:00Z");
        ledger.append(&entry("A", "2026-01-01T09:00:00Z")).unwrap();
        assert_eq!(ledger.status(&IdentityId::from("A")).unwrap().status, PresenceStatus::InOffice);
        ledger.append(&exit("A", "2026-01-01T18:00:00Z")).unwrap();
        assert_eq!(ledger.status(&IdentityId::from("A")).unwrap().status, PresenceStatus::Left);
    }

    #[test]
    fn test_status_ignores_previous_days() {
        let (ledger, clock) = ledger_at("2026-01-01T19:00:00Z");
        ledger.append(&entry("A", "2026-01-01T09:00:00Z")).unwrap();
        clock.set(ts("2026-01-02T08:00:00Z"));
        let report = ledger.status(&IdentityId::from("A")).unwrap();
        assert_eq!(report.status, PresenceStatus::Unknown);
        assert_eq!(report.last_event, Some(EventType::Entry));
    }

    #[test]
    fn test_today_follows_office_offset() {
        let clock = Arc::new(ManualClock::new(ts("2026-01-01T23:30:00Z")));
        let ledger = AttendanceLedger::open_in_memory(clock, FixedOffset::east_opt(3 * 3600).unwrap()).unwrap();
        assert_eq!(ledger.today(), date("2026-01-02"));
        // 21:30Z on Jan 1 is 00:30 local on Jan 2
        ledger.append(&entry("A", "2026-01-01T21:30:00Z")).unwrap();
        assert_eq!(ledger.status(&IdentityId::from("A")).unwrap().status, PresenceStatus::InOffice);
    }

    #[test]
    fn test_present_lists_only_current_entries() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        ledger.append(&entry("A", "2026-01-01T08:00:00Z")).unwrap();
        ledger.append(&entry("B", "2026-01-01T08:30:00Z")).unwrap();
        ledger.append(&exit("B", "2026-01-01T11:00:00Z")).unwrap();
        ledger.append(&entry("C", "2026-01-01T09:00:00Z")).unwrap();

        let present: Vec<String> = ledger
            .present()
            .unwrap()
            .into_iter()
            .map(|r| r.identity.to_string())
            .collect();
        assert_eq!(present, vec!["A", "C"]);
    }

    #[test]
    fn test_record_exit_ignores_cooldown() {
        let (ledger, clock) = ledger_at("2026-01-01T09:00:00Z");
        let gate = CooldownGate::new(300);
        let entered = AttendanceEvent::entry(IdentityId::from("A"), clock.now(), 0.9, TraceId::generate());
        ledger.append_gated(&entered, &gate).unwrap();

        clock.advance(Duration::seconds(10));
        let exit = ledger.record_exit(&IdentityId::from("A"), TraceId::new("t-exit")).unwrap();
        assert_eq!(exit.event.confidence, 1.0);
        assert_eq!(exit.event.event_type, EventType::Exit);
        assert_eq!(ledger.status(&IdentityId::from("A")).unwrap().status, PresenceStatus::Left);
    }

    #[test]
    fn test_latest_event_breaks_timestamp_ties_by_insertion() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        ledger.append(&entry("A", "2026-01-01T08:00:00Z")).unwrap();
        let second = ledger.append(&exit("A", "2026-01-01T08:00:00Z")).unwrap();
        assert_eq!(ledger.latest_event(&IdentityId::from("A")).unwrap().unwrap().id, second);
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        ledger.append(&entry("A", "2026-01-01T10:00:00Z")).unwrap();
        let err = ledger.append(&exit("A", "2026-01-01T09:00:00Z")).unwrap_err();
        assert!(matches!(err, LedgerError::OutOfOrder { .. }));
    }

    #[test]
    fn test_compensating_event_may_be_backdated() {
        let (ledger, _) = ledger_at("2026-01-02T12:00:00Z");
        let forgotten = ledger.append(&entry("A", "2026-01-01T09:00:00Z")).unwrap();
        ledger.append(&entry("A", "2026-01-02T09:00:00Z")).unwrap();
        let fix = exit("A", "2026-01-01T18:00:00Z").compensating(forgotten);
        assert!(ledger.append(&fix).is_ok());
        // today's status still comes from today's entry
        assert_eq!(ledger.status(&IdentityId::from("A")).unwrap().status, PresenceStatus::InOffice);
    }

    #[test]
    fn test_compensating_unknown_event_rejected() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        let err = ledger.append(&exit("A", "2026-01-01T10:00:00Z").compensating(EventId(42))).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownEvent(EventId(42))));
    }

    #[test]
    fn test_compensating_another_identity_rejected() {
        let (ledger, _) = ledger_at("2026-01-02T12:00:00Z");
        let theirs = ledger.append(&entry("B", "2026-01-01T09:00:00Z")).unwrap();
        let err = ledger
            .append(&exit("A", "2026-01-01T18:00:00Z").compensating(theirs))
            .unwrap_err();
        assert!(matches!(err, LedgerError::ForeignCompensation(id) if id == theirs));
        assert_eq!(ledger.count().unwrap(), 1);
    }

    #[test]
    fn test_future_dated_event_is_not_today() {
        let (ledger, clock) = ledger_at("2026-01-01T08:00:00Z");
        ledger.append(&entry("A", "2026-01-01T07:30:00Z")).unwrap();
        ledger.append(&exit("A", "2026-01-02T18:00:00Z")).unwrap();
        ledger.append(&entry("B", "2026-01-02T09:00:00Z")).unwrap();

        let report = ledger.status(&IdentityId::from("A")).unwrap();
        assert_eq!(report.status, PresenceStatus::InOffice);
        assert_eq!(report.last_event, Some(EventType::Exit));
        assert_eq!(ledger.status(&IdentityId::from("B")).unwrap().status, PresenceStatus::Unknown);

        let present: Vec<_> = ledger.present().unwrap().into_iter().map(|r| r.identity).collect();
        assert_eq!(present, vec![IdentityId::from("A")]);

        clock.set(ts("2026-01-02T19:00:00Z"));
        assert_eq!(ledger.status(&IdentityId::from("A")).unwrap().status, PresenceStatus::Left);
        assert_eq!(ledger.status(&IdentityId::from("B")).unwrap().status, PresenceStatus::InOffice);
    }

    #[test]
    fn test_rows_cannot_be_updated_or_deleted() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        ledger.append(&entry("A", "2026-01-01T08:00:00Z")).unwrap();
        let conn = ledger.conn().unwrap();
        assert!(conn.execute("UPDATE attendance_events SET event_type = 'exit'", []).is_err());
        assert!(conn.execute("DELETE FROM attendance_events", []).is_err());
        drop(conn);
        assert_eq!(ledger.count().unwrap(), 1);
    }

    #[test]
    fn test_gated_append_respects_cooldown() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        let gate = CooldownGate::new(300);
        let t0 = ts("2026-01-01T08:00:00Z");

        let first = AttendanceEvent::entry(IdentityId::from("X"), t0, 0.9, TraceId::generate());
        assert!(matches!(ledger.append_gated(&first, &gate).unwrap(), GateDecision::Appended(_)));

        let early = AttendanceEvent::entry(IdentityId::from("X"), t0 + Duration::seconds(299), 0.9, TraceId::generate());
        assert_eq!(
            ledger.append_gated(&early, &gate).unwrap(),
            GateDecision::Suppressed { last_event_at: t0 }
        );

        let later = AttendanceEvent::entry(IdentityId::from("X"), t0 + Duration::seconds(300), 0.9, TraceId::generate());
        assert!(matches!(ledger.append_gated(&later, &gate).unwrap(), GateDecision::Appended(_)));
        assert_eq!(ledger.count().unwrap(), 2);
    }

    #[test]
    fn test_gated_append_requires_identity() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        let mut anonymous = entry("A", "2026-01-01T08:00:00Z");
        anonymous.identity = None;
        assert!(matches!(
            ledger.append_gated(&anonymous, &CooldownGate::default()),
            Err(LedgerError::MissingIdentity)
        ));
    }

    #[test]
    fn test_can_log_entry_reads_ledger() {
        let (ledger, clock) = ledger_at("2026-01-01T08:00:00Z");
        let gate = CooldownGate::new(300);
        let x = IdentityId::from("X");
        assert!(ledger.can_log_entry(&x, &gate).unwrap());
        ledger.append(&entry("X", "2026-01-01T08:00:00Z")).unwrap();
        clock.advance(Duration::seconds(299));
        assert!(!ledger.can_log_entry(&x, &gate).unwrap());
        clock.advance(Duration::seconds(1));
        assert!(ledger.can_log_entry(&x, &gate).unwrap());
    }

    #[test]
    fn test_concurrent_gated_appends_write_once() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        let ledger = Arc::new(ledger);
        let gate = CooldownGate::new(300);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let at = ts("2026-01-01T08:00:00Z") + Duration::milliseconds(i as i64 * 10);
                    let event = AttendanceEvent::entry(IdentityId::from("X"), at, 0.9, TraceId::generate());
                    barrier.wait();
                    ledger.append_gated(&event, &gate)
                })
            })
            .collect();

        let appended = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| matches!(r, Ok(GateDecision::Appended(_))))
            .count();
        assert_eq!(appended, 1);
        assert_eq!(ledger.count().unwrap(), 1);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let (ledger, _) = ledger_at("2026-01-01T12:00:00Z");
        assert!(matches!(
            ledger.history(date("2026-01-02"), date("2026-01-01"), None),
            Err(LedgerError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let clock = Arc::new(ManualClock::new(ts("2026-01-01T12:00:00Z")));
        let ledger = AttendanceLedger::open(&path, clock.clone(), utc()).unwrap();
        ledger.append(&entry("A", "2026-01-01T08:00:00Z")).unwrap();
        drop(ledger);

        let reopened = AttendanceLedger::open(&path, clock, utc()).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }

    #[test]
    fn test_stats_caps_open_session_at_now() {
        let (ledger, _) = ledger_at("2026-01-02T11:00:00Z");
        ledger.append(&entry("A", "2026-01-01T09:00:00Z")).unwrap();
        ledger.append(&exit("A", "2026-01-01T17:00:00Z")).unwrap();
        ledger.append(&entry("A", "2026-01-02T09:00:00Z")).unwrap();
        ledger.append(&entry("B", "2026-01-02T10:00:00Z")).unwrap();

        let stats = ledger.stats(date("2026-01-01"), date("2026-01-02")).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].identity.as_str(), "A");
        assert_eq!(stats[0].total_hours, 10.0);
        assert!(stats[0].open_session);
        assert_eq!(stats[1].total_hours, 1.0);
    }

    #[test]
    fn test_stats_caps_open_session_at_range_end() {
        let (ledger, _) = ledger_at("2026-01-05T12:00:00Z");
        ledger.append(&entry("A", "2026-01-01T20:00:00Z")).unwrap();
        let stats = ledger.stats(date("2026-01-01"), date("2026-01-01")).unwrap();
        assert_eq!(stats[0].total_hours, 4.0);
    }

    #[test]
    fn test_timestamp_encoding_is_fixed_width() {
        let a = encode_ts(ts("2026-01-01T08:00:00Z"));
        let b = encode_ts(ts("2026-01-01T08:00:00.5Z"));
        assert_eq!(a, "2026-01-01T08:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }
}
