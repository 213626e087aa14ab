//! Debug photo archive: `<root>/<YYYY-MM-DD>/<trace_id>.<ext>`.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use presence_core::TraceId;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PhotoArchive {
    root: PathBuf,
    offset: FixedOffset,
    ttl_days: u32,
}

impl PhotoArchive {
    pub fn new(root: impl Into<PathBuf>, offset: FixedOffset, ttl_days: u32) -> Self {
        Self {
            root: root.into(),
            offset,
            ttl_days,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path relative to the archive root, as stored on the event.
    pub fn reference_for(&self, trace_id: &TraceId, at: DateTime<Utc>, extension: &str) -> String {
        let date = at.with_timezone(&self.offset).date_naive();
        format!("{}/{}.{}", date.format("%Y-%m-%d"), trace_id, extension)
    }

    pub fn save(&self, reference: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.root.join(reference);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Remove dated directories older than the TTL. Returns how many went.
    pub fn prune(&self, now: DateTime<Utc>) -> std::io::Result<usize> {
        let today = now.with_timezone(&self.offset).date_naive();
        let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(self.ttl_days))) else {
            return Ok(0);
        };

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok()) else {
                continue;
            };
            if date < cutoff && entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
                tracing::debug!(dir = %entry.path().display(), "expired photo directory removed");
                removed += 1;
            }
        }
        Ok(removed)
    }
}
