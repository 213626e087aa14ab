//! Lazy, restartable history queries.

use crate::ledger::{encode_ts, AttendanceLedger, LedgerEntry, LedgerError};
use chrono::{DateTime, Utc};
use presence_core::IdentityId;
use std::collections::VecDeque;

const DEFAULT_PAGE_SIZE: usize = 256;

/// Events in a time window, oldest first.
///
/// Nothing is read until iteration starts. Each call to [`History::iter`]
/// starts a fresh pass over the ledger, so the handle can be consumed more
/// than once.
pub struct History<'a> {
    ledger: &'a AttendanceLedger,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    identity: Option<IdentityId>,
    page_size: usize,
}

impl<'a> History<'a> {
    pub(crate) fn new(
        ledger: &'a AttendanceLedger,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        identity: Option<IdentityId>,
    ) -> Self {
        Self {
            ledger,
            from,
            until,
            identity,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Half-open UTC window `[from, until)` this history covers.
    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.from, self.until)
    }

    pub fn iter(&self) -> HistoryIter<'a> {
        HistoryIter {
            ledger: self.ledger,
            from: encode_ts(self.from),
            until: encode_ts(self.until),
            identity: self.identity.as_ref().map(|i| i.as_str().to_string()),
            page_size: self.page_size,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn collect_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &History<'a> {
    type Item = Result<LedgerEntry, LedgerError>;
    type IntoIter = HistoryIter<'a>;

    fn into_iter(self) -> HistoryIter<'a> {
        self.iter()
    }
}

/// Keyset-paginated cursor over `(timestamp, id)`.
pub struct HistoryIter<'a> {
    ledger: &'a AttendanceLedger,
    from: String,
    until: String,
    identity: Option<String>,
    page_size: usize,
    cursor: Option<(String, i64)>,
    buffer: VecDeque<LedgerEntry>,
    exhausted: bool,
}

impl Iterator for HistoryIter<'_> {
    type Item = Result<LedgerEntry, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.buffer.pop_front() {
            return Some(Ok(entry));
        }
        if self.exhausted {
            return None;
        }

        let page = self.ledger.page(
            &self.from,
            &self.until,
            self.identity.as_deref(),
            self.cursor.as_ref(),
            self.page_size,
        );
        match page {
            Ok(rows) => {
                if rows.len() < self.page_size {
                    self.exhausted = true;
                }
                if let Some(last) = rows.last() {
                    self.cursor = Some((encode_ts(last.event.timestamp), last.id.0));
                }
                self.buffer.extend(rows);
                self.buffer.pop_front().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}
