//! Session pairing and per-identity summaries.
//!
//! Events are walked in time order. An `entry` opens a session, the next
//! `exit` closes it. A second `entry` while a session is open closes the
//! previous one at the new entry's timestamp. An `exit` with nothing open is
//! counted in `unpaired_exits` and otherwise ignored. A session still open at
//! the end runs until `horizon`.

use crate::ledger::local_date;
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use presence_core::{AttendanceEvent, EventType, IdentityId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityStats {
    pub identity: IdentityId,
    /// Rounded to two decimals.
    pub total_hours: f64,
    /// Distinct local dates with at least one entry.
    pub total_days: u32,
    pub sessions: u32,
    pub open_session: bool,
    pub unpaired_exits: u32,
    /// Mean local time of first entry per day, `HH:MM`.
    pub avg_arrival: Option<String>,
    /// Mean local time of last exit per day, `HH:MM`.
    pub avg_departure: Option<String>,
}

pub fn summarize(
    identity: IdentityId,
    events: &[AttendanceEvent],
    horizon: DateTime<Utc>,
    offset: FixedOffset,
) -> IdentityStats {
    let mut open: Option<DateTime<Utc>> = None;
    let mut seconds = 0i64;
    let mut sessions = 0u32;
    let mut unpaired_exits = 0u32;

    let mut days = BTreeSet::new();
    let mut arrivals: Vec<(NaiveDate, u32)> = Vec::new();
    let mut departures: Vec<(NaiveDate, u32)> = Vec::new();

    for event in events {
        let date = local_date(event.timestamp, offset);
        let time_of_day = event.timestamp.with_timezone(&offset).num_seconds_from_midnight();

        match event.event_type {
            EventType::Entry => {
                if let Some(start) = open.take() {
                    seconds += (event.timestamp - start).num_seconds().max(0);
                    sessions += 1;
                }
                open = Some(event.timestamp);
                if days.insert(date) {
                    arrivals.push((date, time_of_day));
                }
            }
            EventType::Exit => match open.take() {
                Some(start) => {
                    seconds += (event.timestamp - start).num_seconds().max(0);
                    sessions += 1;
                    match departures.last_mut() {
                        Some((d, t)) if *d == date => *t = time_of_day,
                        _ => departures.push((date, time_of_day)),
                    }
                }
                None => unpaired_exits += 1,
            },
        }
    }

    let open_session = open.is_some();
    if let Some(start) = open {
        seconds += (horizon - start).num_seconds().max(0);
        sessions += 1;
    }

    IdentityStats {
        identity,
        total_hours: (seconds as f64 / 3600.0 * 100.0).round() / 100.0,
        total_days: u32::try_from(days.len()).unwrap_or(u32::MAX),
        sessions,
        open_session,
        unpaired_exits,
        avg_arrival: mean_clock_time(&arrivals),
        avg_departure: mean_clock_time(&departures),
    }
}

fn mean_clock_time(samples: &[(NaiveDate, u32)]) -> Option<String> {
    if samples.is_empty() {
        return None;
    }
    let total: u64 = samples.iter().map(|&(_, s)| u64::from(s)).sum();
    let mean = total / samples.len() as u64;
    Some(format!("{:02}:{:02}", mean / 3600, (mean % 3600) / 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::TraceId;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn entry(at: &str) -> AttendanceEvent {
        AttendanceEvent::entry(IdentityId::from("A"), ts(at), 0.9, TraceId::generate())
    }

    fn exit(at: &str) -> AttendanceEvent {
        AttendanceEvent::exit(IdentityId::from("A"), ts(at), TraceId::generate())
    }

    #[test]
    fn test_paired_sessions_sum_hours() {
        let events = vec![
            entry("2026-01-01T09:00:00Z"),
            exit("2026-01-01T17:30:00Z"),
            entry("2026-01-02T08:00:00Z"),
            exit("2026-01-02T16:00:00Z"),
        ];
        let stats = summarize(IdentityId::from("A"), &events, ts("2026-01-03T00:00:00Z"), utc());
        assert_eq!(stats.total_hours, 16.5);
        assert_eq!(stats.total_days, 2);
        assert_eq!(stats.sessions, 2);
        assert!(!stats.open_session);
        assert_eq!(stats.avg_arrival.as_deref(), Some("08:30"));
        assert_eq!(stats.avg_departure.as_deref(), Some("16:45"));
    }

    #[test]
    fn test_trailing_entry_runs_to_horizon() {
        let events = vec![entry("2026-01-01T09:00:00Z")];
        let stats = summarize(IdentityId::from("A"), &events, ts("2026-01-01T11:15:00Z"), utc());
        assert_eq!(stats.total_hours, 2.25);
        assert!(stats.open_session);
        assert_eq!(stats.avg_departure, None);
    }

    #[test]
    fn test_double_entry_closes_previous_session() {
        let events = vec![
            entry("2026-01-01T09:00:00Z"),
            entry("2026-01-01T10:00:00Z"),
            exit("2026-01-01T12:00:00Z"),
        ];
        let stats = summarize(IdentityId::from("A"), &events, ts("2026-01-02T00:00:00Z"), utc());
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.total_hours, 3.0);
        assert_eq!(stats.total_days, 1);
        assert_eq!(stats.avg_arrival.as_deref(), Some("09:00"));
    }

    #[test]
    fn test_orphan_exit_is_counted_not_summed() {
        let events = vec![exit("2026-01-01T08:00:00Z"), entry("2026-01-01T09:00:00Z"), exit("2026-01-01T10:00:00Z")];
        let stats = summarize(IdentityId::from("A"), &events, ts("2026-01-02T00:00:00Z"), utc());
        assert_eq!(stats.unpaired_exits, 1);
        assert_eq!(stats.total_hours, 1.0);
    }

    #[test]
    fn test_hours_round_to_two_decimals() {
        let events = vec![entry("2026-01-01T09:00:00Z"), exit("2026-01-01T09:20:00Z")];
        let stats = summarize(IdentityId::from("A"), &events, ts("2026-01-02T00:00:00Z"), utc());
        assert_eq!(stats.total_hours, 0.33);
    }

    #[test]
    fn test_clock_times_use_local_offset() {
        let events = vec![entry("2026-01-01T06:00:00Z"), exit("2026-01-01T14:00:00Z")];
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let stats = summarize(IdentityId::from("A"), &events, ts("2026-01-02T00:00:00Z"), offset);
        assert_eq!(stats.avg_arrival.as_deref(), Some("09:00"));
        assert_eq!(stats.avg_departure.as_deref(), Some("17:00"));
    }
}
