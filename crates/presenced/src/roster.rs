//! Enrolled roster snapshots, refreshed in the background.
//!
//! The current roster is an immutable `Arc<Roster>` published over a
//! `watch` channel. Requests clone the `Arc` and never block a refresh.

use chrono::{DateTime, Utc};
use presence_core::{Clock, EnrolledEmbedding, IdentityId};
use presence_store::{EnrollmentError, EnrollmentStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Roster {
    pub entries: Vec<EnrolledEmbedding>,
    pub loaded_at: DateTime<Utc>,
    /// Entries discarded because they came from another model version.
    pub dropped: usize,
}

impl Roster {
    pub fn empty(loaded_at: DateTime<Utc>) -> Self {
        Self {
            entries: Vec::new(),
            loaded_at,
            dropped: 0,
        }
    }

    /// Keep entries produced by `model_version` (or carrying no version).
    pub fn for_model(entries: Vec<EnrolledEmbedding>, model_version: &str, loaded_at: DateTime<Utc>) -> Self {
        let total = entries.len();
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|e| e.embedding.model_version.as_deref().map_or(true, |v| v == model_version))
            .collect();
        let dropped = total - entries.len();
        if dropped > 0 {
            tracing::warn!(
                dropped,
                model_version,
                "enrolled embeddings from another model version ignored; re-enroll them"
            );
        }
        Self {
            entries,
            loaded_at,
            dropped,
        }
    }

    pub fn display_name(&self, identity: &IdentityId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| &e.identity.id == identity)
            .map(|e| e.identity.display_name.as_str())
    }

    pub fn identity_count(&self) -> usize {
        self.entries.iter().map(|e| &e.identity.id).collect::<HashSet<_>>().len()
    }
}

/// Read the enrollment store off the async runtime.
pub async fn load_roster(
    store: Arc<dyn EnrollmentStore>,
    model_version: &str,
    clock: &dyn Clock,
) -> Result<Roster, EnrollmentError> {
    let entries = tokio::task::spawn_blocking(move || store.list_embeddings())
        .await
        .map_err(|e| EnrollmentError::Aborted(e.to_string()))??;
    Ok(Roster::for_model(entries, model_version, clock.now()))
}

/// Reload the roster every `period`, keeping the previous snapshot on failure.
///
/// Stops once every receiver is gone.
pub fn spawn_refresher(
    store: Arc<dyn EnrollmentStore>,
    model_version: String,
    clock: Arc<dyn Clock>,
    period: Duration,
    tx: watch::Sender<Arc<Roster>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let now = tokio::time::Instant::now();
        let first = now.checked_add(period).unwrap_or(now);
        let mut ticker = tokio::time::interval_at(first, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            match load_roster(Arc::clone(&store), &model_version, clock.as_ref()).await {
                Ok(roster) => {
                    tracing::debug!(
                        embeddings = roster.entries.len(),
                        identities = roster.identity_count(),
                        "roster refreshed"
                    );
                    tx.send_replace(Arc::new(roster));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "roster refresh failed; keeping previous roster");
                }
            }
        }
        tracing::debug!("roster refresher stopped");
    })
}
