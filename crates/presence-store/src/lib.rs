//! Persistence for attendance: the append-only event ledger and the
//! read-only enrollment roster.

pub mod enrollment;
pub mod history;
pub mod ledger;
pub mod stats;

pub use enrollment::{EnrollmentError, EnrollmentStore, SqliteEnrollmentStore};
pub use history::{History, HistoryIter};
pub use ledger::{AttendanceLedger, GateDecision, LedgerEntry, LedgerError, StatusReport};
pub use stats::IdentityStats;
