//! Relationship edges
//!
//! An edge is the durable aggregate of every observation of one
//! (subject, predicate, object) triple. Strength is derived from how often and
//! in how many distinct contexts the triple was seen, never set directly.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tags::Predicate;

/// Strength of an edge, with diminishing returns on repetition.
///
/// `sqrt(min(m, mention_cap)/mention_cap * min(c, context_cap)/context_cap * avg)`
pub fn edge_strength(
    mention_count: u64,
    context_count: u64,
    average_confidence: f64,
    mention_cap: u32,
    context_cap: u32,
) -> f64 {
    let mention_cap = f64::from(mention_cap.max(1));
    let context_cap = f64::from(context_cap.max(1));
    let mentions = (mention_count as f64).min(mention_cap) / mention_cap;
    let contexts = (context_count as f64).min(context_cap) / context_cap;
    (mentions * contexts * average_confidence.clamp(0.0, 1.0))
        .sqrt()
        .clamp(0.0, 1.0)
}

/// Bounded set of the most recent context ids that produced an observation.
///
/// Older ids fall out of the window, so a context that returns after more
/// than `capacity` other contexts is counted again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextWindow(VecDeque<String>);

impl ContextWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, context_id: &str) -> bool {
        self.0.iter().any(|c| c == context_id)
    }

    /// Record a context; returns true when it was not in the window
    pub fn observe(&mut self, context_id: &str, capacity: usize) -> bool {
        if self.contains(context_id) {
            return false;
        }
        self.0.push_back(context_id.to_string());
        while self.0.len() > capacity.max(1) {
            self.0.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// A directed, typed connection between two canonical nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub id: String,
    pub subject_id: String,
    pub predicate: Predicate,
    pub object_id: String,
    /// Derived, 0.0 to 1.0
    pub strength: f64,
    pub mention_count: u64,
    /// Distinct contexts, not total mentions
    pub context_count: u64,
    /// Running average of observation confidence
    pub confidence: f64,
    pub recent_contexts: ContextWindow,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// When a maintenance pass last decayed this edge
    pub last_decayed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Set by a prune pass; the next pass deletes the row
    pub pending_delete: bool,
    pub version: i64,
}

/// Caps and window size used when folding an observation into an edge
#[derive(Debug, Clone, Copy)]
pub struct StrengthParams {
    pub mention_cap: u32,
    pub context_cap: u32,
    pub context_window: usize,
}

impl RelationshipEdge {
    /// First observation of a triple: strength starts at the observed confidence
    pub fn new(
        subject_id: impl Into<String>,
        predicate: Predicate,
        object_id: impl Into<String>,
        confidence: f64,
        context_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        let mut recent_contexts = ContextWindow::new();
        recent_contexts.observe(context_id, usize::MAX);

        Self {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            predicate,
            object_id: object_id.into(),
            strength: confidence,
            mention_count: 1,
            context_count: 1,
            confidence,
            recent_contexts,
            first_seen: now,
            last_seen: now,
            last_decayed_at: None,
            archived_at: None,
            pending_delete: false,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }

    pub fn is_reflexive(&self) -> bool {
        self.subject_id == self.object_id
    }

    /// The endpoint on the other side of `node_id`
    pub fn other_end(&self, node_id: &str) -> &str {
        if self.subject_id == node_id {
            &self.object_id
        } else {
            &self.subject_id
        }
    }

    /// Fold a repeat observation into the edge. Returns true when the edge
    /// was archived and has been revived by this observation.
    pub fn reinforce(
        &mut self,
        confidence: f64,
        context_id: &str,
        now: DateTime<Utc>,
        params: StrengthParams,
    ) -> bool {
        let count = self.mention_count as f64;
        self.confidence =
            ((self.confidence * count + confidence) / (count + 1.0)).clamp(0.0, 1.0);
        self.mention_count += 1;
        if self.recent_contexts.observe(context_id, params.context_window) {
            self.context_count += 1;
        }
        if now > self.last_seen {
            self.last_seen = now;
        }

        self.recompute_strength(params);

        let revived = self.archived_at.is_some();
        self.archived_at = None;
        self.pending_delete = false;
        revived
    }

    pub fn recompute_strength(&mut self, params: StrengthParams) {
        self.strength = edge_strength(
            self.mention_count,
            self.context_count,
            self.confidence,
            params.mention_cap,
            params.context_cap,
        );
    }

    /// Neither reinforced nor decayed within the decay window.
    ///
    /// Counting from the last decay keeps repeated passes to one decay per
    /// window however often they run. An unrepresentable window never elapses.
    pub fn is_unreinforced(&self, now: DateTime<Utc>, window_days: i64) -> bool {
        let since = match self.last_decayed_at {
            Some(decayed) => decayed.max(self.last_seen),
            None => self.last_seen,
        };
        match Duration::try_days(window_days) {
            Some(window) => now.signed_duration_since(since) > window,
            None => false,
        }
    }

    /// Multiply strength by `1 - factor`
    pub fn decay(&mut self, factor: f64, now: DateTime<Utc>) {
        self.strength = (self.strength * (1.0 - factor)).clamp(0.0, 1.0);
        self.last_decayed_at = Some(now);
    }

    /// Archive and flag for deletion on the next cleanup pass
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.archived_at = Some(now);
        self.pending_delete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: StrengthParams = StrengthParams {
        mention_cap: 10,
        context_cap: 5,
        context_window: 3,
    };

    fn edge(confidence: f64) -> RelationshipEdge {
        RelationshipEdge::new("a", Predicate::WorksOn, "b", confidence, "ctx-1", Utc::now())
    }

    #[test]
    fn test_strength_formula() {
        assert_eq!(edge_strength(10, 5, 1.0, 10, 5), 1.0);
        assert_eq!(edge_strength(0, 5, 1.0, 10, 5), 0.0);
        let s = edge_strength(5, 1, 0.8, 10, 5);
        assert!((s - (0.5f64 * 0.2 * 0.8).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_strength_caps_repetition() {
        assert_eq!(
            edge_strength(10, 5, 0.9, 10, 5),
            edge_strength(500, 50, 0.9, 10, 5)
        );
    }

    #[test]
    fn test_new_edge_starts_at_confidence() {
        let e = edge(0.7);
        assert_eq!(e.strength, 0.7);
        assert_eq!(e.mention_count, 1);
        assert_eq!(e.context_count, 1);
        assert!(e.recent_contexts.contains("ctx-1"));
    }

    #[test]
    fn test_reinforce_counts_distinct_contexts() {
        let mut e = edge(0.8);
        e.reinforce(0.8, "ctx-1", Utc::now(), PARAMS);
        assert_eq!(e.mention_count, 2);
        assert_eq!(e.context_count, 1);

        e.reinforce(0.8, "ctx-2", Utc::now(), PARAMS);
        assert_eq!(e.mention_count, 3);
        assert_eq!(e.context_count, 2);
    }

    #[test]
    fn test_context_window_is_bounded() {
        let mut window = ContextWindow::new();
        for ctx in ["a", "b", "c", "d"] {
            assert!(window.observe(ctx, 3));
        }
        assert_eq!(window.len(), 3);
        assert!(!window.contains("a"));
        assert!(!window.observe("d", 3));
    }

    #[test]
    fn test_reinforce_revives_archived_edge() {
        let mut e = edge(0.8);
        e.prune(Utc::now());
        assert!(!e.is_active());
        assert!(e.pending_delete);

        let revived = e.reinforce(0.8, "ctx-2", Utc::now(), PARAMS);
        assert!(revived);
        assert!(e.is_active());
        assert!(!e.pending_delete);
    }

    #[test]
    fn test_decay_and_window() {
        let mut e = edge(0.5);
        let later = e.last_seen + Duration::days(31);
        assert!(e.is_unreinforced(later, 30));
        assert!(!e.is_unreinforced(e.last_seen + Duration::days(5), 30));

        e.decay(0.1, later);
        assert!((e.strength - 0.45).abs() < 1e-12);
        // The window restarts at the decay
        assert!(!e.is_unreinforced(later + Duration::hours(1), 30));
        assert!(e.is_unreinforced(later + Duration::days(31), 30));
    }

    #[test]
    fn test_huge_window_never_elapses() {
        let e = edge(0.5);
        let far = e.last_seen + Duration::days(100_000);
        assert!(!e.is_unreinforced(far, i64::MAX));
        assert!(!e.is_unreinforced(far, 1_000_000_000_000));
        assert!(e.is_unreinforced(far, 36_500));
    }

    #[test]
    fn test_other_end() {
        let e = edge(0.5);
        assert_eq!(e.other_end("a"), "b");
        assert_eq!(e.other_end("b"), "a");
        assert!(!e.is_reflexive());
    }
}
