//! Precomputed nearest-neighbour cache entries
//!
//! Entries are a pure cache over the graph and can be dropped or rebuilt at
//! any time without losing data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tags::EntityType;

/// One neighbour of an indexed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityCandidate {
    pub item_id: String,
    pub score: f64,
    /// One-line reason, e.g. "similar name (0.82); 2 shared tags (backend, search)"
    pub explanation: String,
}

/// Top-K neighbours for one subject item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityIndexEntry {
    pub subject_id: String,
    pub item_kind: EntityType,
    /// Ordered by descending score, at most K long
    pub candidates: Vec<SimilarityCandidate>,
    pub computed_at: DateTime<Utc>,
    /// Subject changed since `computed_at`
    pub stale: bool,
}

impl SimilarityIndexEntry {
    pub fn new(
        subject_id: impl Into<String>,
        item_kind: EntityType,
        candidates: Vec<SimilarityCandidate>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            item_kind,
            candidates,
            computed_at,
            stale: false,
        }
    }
}

/// Answer to a "related items" query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityLookup {
    pub subject_id: String,
    pub candidates: Vec<SimilarityCandidate>,
    /// Results may be out of date (stale entry or on-the-fly scan)
    pub stale: bool,
    /// When the underlying entry was computed; None for a scan
    pub computed_at: Option<DateTime<Utc>>,
    /// Served from the precomputed index rather than a scan
    pub from_index: bool,
}

impl From<SimilarityIndexEntry> for SimilarityLookup {
    fn from(entry: SimilarityIndexEntry) -> Self {
        Self {
            subject_id: entry.subject_id,
            candidates: entry.candidates,
            stale: entry.stale,
            computed_at: Some(entry.computed_at),
            from_index: true,
        }
    }
}

/// Outcome of an index rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub item_kind: EntityType,
    pub rebuilt: usize,
    pub total: usize,
    /// False when the run was cancelled before every item was written
    pub completed: bool,
}

impl RebuildReport {
    /// Map a partial run to `IndexBuildInterrupted`
    pub fn into_result(self) -> crate::Result<Self> {
        if self.completed {
            Ok(self)
        } else {
            Err(crate::Error::IndexBuildInterrupted {
                rebuilt: self.rebuilt,
                total: self.total,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_lookup_from_entry() {
        let entry = SimilarityIndexEntry::new("n1", EntityType::Task, vec![], Utc::now());
        assert!(!entry.stale);
        let lookup = SimilarityLookup::from(entry);
        assert!(lookup.from_index);
        assert!(lookup.computed_at.is_some());
    }

    #[test]
    fn test_partial_rebuild_is_interrupted_error() {
        let report = RebuildReport {
            item_kind: EntityType::Task,
            rebuilt: 3,
            total: 10,
            completed: false,
        };
        match report.into_result() {
            Err(Error::IndexBuildInterrupted { rebuilt, total }) => {
                assert_eq!((rebuilt, total), (3, 10));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_complete_rebuild_is_ok() {
        let report = RebuildReport {
            item_kind: EntityType::Concept,
            rebuilt: 0,
            total: 0,
            completed: true,
        };
        assert!(report.into_result().is_ok());
    }
}
