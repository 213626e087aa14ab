//! Nearest-neighbour matching of a query embedding against the roster.
//!
//! Metric is Euclidean distance. Tiers:
//!
//! ```text
//! distance <  0.40          match
//! 0.40 <= distance <= 0.60  low_confidence
//! distance >  0.60          unknown
//! ```
//!
//! Cosine similarity uses the opposite direction and different thresholds;
//! it is not offered here.

use crate::types::{EnrolledEmbedding, Embedding, Identity, IdentityId, MatchResult, MatchTier};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Upper bound (exclusive) of the `match` tier.
pub const MATCH_DISTANCE: f64 = 0.40;
/// Upper bound (inclusive) of the `low_confidence` tier.
pub const LOW_CONFIDENCE_DISTANCE: f64 = 0.60;
/// Per-identity minimum distances closer than this are a tie.
pub const TIE_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("dimension mismatch: query has {expected} components, roster entry for {identity} has {found}")]
    DimensionMismatch {
        identity: IdentityId,
        expected: usize,
        found: usize,
    },
    #[error("model version mismatch: query from {query}, roster entry for {identity} from {roster}")]
    ModelVersionMismatch {
        identity: IdentityId,
        query: String,
        roster: String,
    },
    #[error("query embedding is empty")]
    EmptyQuery,
    #[error("non-finite component in {0}")]
    NonFinite(String),
}

/// Map a distance onto its confidence tier.
pub fn classify(distance: f64) -> MatchTier {
    if distance < MATCH_DISTANCE {
        MatchTier::Match
    } else if distance <= LOW_CONFIDENCE_DISTANCE {
        MatchTier::LowConfidence
    } else {
        MatchTier::Unknown
    }
}

/// Strategy for comparing a query embedding against a roster.
pub trait Matcher {
    fn compare(
        &self,
        query: &Embedding,
        roster: &[EnrolledEmbedding],
        at: DateTime<Utc>,
    ) -> Result<MatchResult, MatchError>;
}

/// Euclidean nearest-neighbour matcher.
///
/// Every roster entry is visited and validated, so a single malformed entry
/// fails the whole pass instead of being skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &Embedding,
        roster: &[EnrolledEmbedding],
        at: DateTime<Utc>,
    ) -> Result<MatchResult, MatchError> {
        if roster.is_empty() {
            return Ok(MatchResult::empty_roster(at));
        }
        if query.dimension() == 0 {
            return Err(MatchError::EmptyQuery);
        }
        if !query.is_finite() {
            return Err(MatchError::NonFinite("query".into()));
        }

        // Closest distance per identity; an identity may enroll several faces.
        let mut nearest: BTreeMap<&IdentityId, (&Identity, f64)> = BTreeMap::new();

        for entry in roster {
            check_entry(query, entry)?;
            let distance = query.euclidean_distance(&entry.embedding);
            nearest
                .entry(&entry.identity.id)
                .and_modify(|slot| {
                    if distance < slot.1 {
                        slot.1 = distance;
                    }
                })
                .or_insert((&entry.identity, distance));
        }

        let Some((best_identity, best_distance)) = nearest
            .values()
            .copied()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            return Ok(MatchResult::empty_roster(at));
        };

        let ambiguous = nearest.values().any(|(identity, distance)| {
            identity.id != best_identity.id && (distance - best_distance).abs() <= TIE_TOLERANCE
        });

        if ambiguous {
            tracing::debug!(distance = best_distance, "equidistant identities; not asserting a match");
            return Ok(MatchResult {
                candidate: None,
                distance: Some(best_distance),
                tier: MatchTier::LowConfidence,
                ambiguous: true,
                timestamp: at,
            });
        }

        let tier = classify(best_distance);
        Ok(MatchResult {
            candidate: (tier != MatchTier::Unknown).then(|| best_identity.clone()),
            distance: Some(best_distance),
            tier,
            ambiguous: false,
            timestamp: at,
        })
    }
}

fn check_entry(query: &Embedding, entry: &EnrolledEmbedding) -> Result<(), MatchError> {
    let found = entry.embedding.dimension();
    if found != query.dimension() {
        return Err(MatchError::DimensionMismatch {
            identity: entry.identity.id.clone(),
            expected: query.dimension(),
            found,
        });
    }
    if let (Some(q), Some(r)) = (&query.model_version, &entry.embedding.model_version) {
        if q != r {
            return Err(MatchError::ModelVersionMismatch {
                identity: entry.identity.id.clone(),
                query: q.clone(),
                roster: r.clone(),
            });
        }
    }
    if !entry.embedding.is_finite() {
        return Err(MatchError::NonFinite(format!("roster entry for {}", entry.identity.id)));
    }
    Ok(())
}
