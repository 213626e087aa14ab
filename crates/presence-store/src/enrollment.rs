//! Read-only access to the enrollment database.
//!
//! Enrollment is owned by another service. This side only reads active
//! employees and their embeddings; it never writes.

use presence_core::{EnrolledEmbedding, Embedding, Identity};
use rusqlite::{Connection, OpenFlags};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("enrollment database not found: {0}")]
    NotFound(PathBuf),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("enrollment read aborted: {0}")]
    Aborted(String),
}

/// Source of the roster the matcher compares against.
pub trait EnrollmentStore: Send + Sync {
    fn list_embeddings(&self) -> Result<Vec<EnrolledEmbedding>, EnrollmentError>;
}

/// Enrollment store backed by SQLite.
///
/// Expected schema:
/// `employees(id, full_name, is_active)` and
/// `embeddings(employee_id, vector, model_version)`, where `vector` is a
/// JSON array of floats.
pub struct SqliteEnrollmentStore {
    path: PathBuf,
}

impl SqliteEnrollmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn connect(&self) -> Result<Connection, EnrollmentError> {
        if !self.path.exists() {
            return Err(EnrollmentError::NotFound(self.path.clone()));
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }
}

impl EnrollmentStore for SqliteEnrollmentStore {
    fn list_embeddings(&self) -> Result<Vec<EnrolledEmbedding>, EnrollmentError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT CAST(e.id AS TEXT), e.full_name, m.vector, m.model_version
             FROM employees e
             JOIN embeddings m ON m.employee_id = e.id
             WHERE e.is_active = 1
             ORDER BY e.id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut roster = Vec::new();
        let mut skipped = 0usize;
        for row in rows {
            let (id, name, vector, model_version) = row?;
            let values: Vec<f32> = match serde_json::from_str(&vector) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(identity = %id, error = %e, "skipping unreadable enrolled embedding");
                    skipped += 1;
                    continue;
                }
            };
            if values.is_empty() {
                tracing::warn!(identity = %id, "skipping empty enrolled embedding");
                skipped += 1;
                continue;
            }

            roster.push(EnrolledEmbedding {
                identity: Identity::new(id, name),
                embedding: Embedding {
                    values,
                    model_version,
                },
            });
        }

        tracing::debug!(
            path = %self.path.display(),
            embeddings = roster.len(),
            skipped,
            "enrollment roster read"
        );
        Ok(roster)
    }
}
