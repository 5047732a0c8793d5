//! Entity resolution
//!
//! Turns a noisy mention (name, type, confidence, context) into the canonical
//! node it belongs to, creating one when nothing matches well enough.
//!
//! Decision ladder:
//! 1. Exact folded match on canonical name or alias (same type, active)
//! 2. Fuzzy candidates: best similarity over the node's name variants, kept
//!    when at least `candidate_floor`
//! 3. Ranking: `total = score + mention_boost + recency_boost`
//! 4. `total < merge_threshold` creates a node, the band up to
//!    `confident_merge_threshold` merges without promoting the canonical name
//!    and flags the decision for audit, anything above merges fully.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::error::Result;

use super::locks::TypeLocks;
use super::node::{CanonicalNode, MentionEffect, MentionRecord, MergeDecision, Resolution};
use super::observation::{validate_confidence, validate_context_id, validate_name};
use super::repository::GraphStore;
use super::similarity::{SimilarityScorer, fold_name};
use super::tags::EntityType;

/// A fuzzy candidate with its ranking
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub node: CanonicalNode,
    /// Best name similarity over the node's variants
    pub score: f64,
    /// Score plus mention and recency boosts
    pub total: f64,
}

/// Deterministic ordering: higher total, then more mentions, then smaller id
fn compare_candidates(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.total
        .partial_cmp(&a.total)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.node.mention_count.cmp(&a.node.mention_count))
        .then_with(|| a.node.id.cmp(&b.node.id))
}

/// Resolves mentions to canonical nodes
pub struct EntityResolver<S: GraphStore> {
    store: Arc<S>,
    config: ResolverConfig,
    scorer: SimilarityScorer,
    locks: TypeLocks,
}

impl<S: GraphStore> EntityResolver<S> {
    pub fn new(store: Arc<S>, config: ResolverConfig) -> Self {
        let scorer = SimilarityScorer::new(config.abbreviation_bonus);
        Self {
            store,
            config,
            scorer,
            locks: TypeLocks::new(),
        }
    }

    /// Share type locks with other resolvers over the same store
    pub fn with_locks(mut self, locks: TypeLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn scorer(&self) -> &SimilarityScorer {
        &self.scorer
    }

    /// Find or create the canonical node for a mention
    pub async fn resolve_or_create(
        &self,
        name: &str,
        entity_type: &EntityType,
        confidence: f64,
        context_id: &str,
    ) -> Result<CanonicalNode> {
        let resolution = self
            .resolve(name, entity_type, confidence, context_id, &Map::new(), Utc::now())
            .await?;
        Ok(resolution.node)
    }

    /// Resolve a mention, merging `metadata` into the node, and report the
    /// decision that was taken
    pub async fn resolve(
        &self,
        name: &str,
        entity_type: &EntityType,
        confidence: f64,
        context_id: &str,
        metadata: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        validate_name("entity name", name)?;
        validate_confidence(confidence)?;
        validate_context_id(context_id)?;

        let _guard = self.locks.acquire(entity_type).await;

        let mut attempt = 0;
        loop {
            match self
                .try_resolve(name, entity_type, confidence, context_id, metadata, now)
                .await
            {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(name = %name, entity_type = %entity_type, attempt, error = %e, "Retrying entity resolution");
                }
                other => return other,
            }
        }
    }

    async fn try_resolve(
        &self,
        name: &str,
        entity_type: &EntityType,
        confidence: f64,
        context_id: &str,
        metadata: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let folded = fold_name(name);
        let nodes = self.store.list_nodes(Some(entity_type), false).await?;

        let (node, decision, score) = match self.exact_match(&folded, &nodes) {
            Some(node) => (Some(node.clone()), MergeDecision::ExactMatch, 1.0),
            None => match self.best_candidate(name, nodes, now) {
                Some(best) if best.total >= self.config.confident_merge_threshold => {
                    (Some(best.node), MergeDecision::Merged, best.total)
                }
                Some(best) if best.total >= self.config.merge_threshold => {
                    (Some(best.node), MergeDecision::LowConfidenceMerge, best.total)
                }
                Some(best) => (None, MergeDecision::Created, best.total),
                None => (None, MergeDecision::Created, 0.0),
            },
        };

        let node = match node {
            Some(mut node) => {
                let allow_promotion = decision != MergeDecision::LowConfidenceMerge;
                let mut effect = node.record_mention(name, confidence, now, allow_promotion);
                effect.metadata_changed = node.merge_metadata(metadata);

                self.store.update_node(&node).await?;
                node.version += 1;
                self.log_merge(&node, name, decision, score, effect);

                if effect.touches_index() {
                    self.store.mark_index_stale(&node.id).await?;
                }
                node
            }
            None => {
                let mut node = CanonicalNode::new(name, entity_type.clone(), confidence, now);
                node.merge_metadata(metadata);
                self.store.insert_node(&node).await?;
                info!(
                    node_id = %node.id,
                    name = %node.canonical_name,
                    entity_type = %entity_type,
                    best_total = score,
                    "Created canonical node"
                );
                node
            }
        };

        self.store
            .record_mention(&MentionRecord {
                node_id: node.id.clone(),
                context_id: context_id.to_string(),
                raw_name: name.to_string(),
                decision,
                score,
                observed_at: now,
            })
            .await?;

        Ok(Resolution {
            node,
            decision,
            score,
        })
    }

    fn log_merge(
        &self,
        node: &CanonicalNode,
        name: &str,
        decision: MergeDecision,
        score: f64,
        effect: MentionEffect,
    ) {
        match decision {
            MergeDecision::LowConfidenceMerge => info!(
                node_id = %node.id,
                name = %name,
                canonical = %node.canonical_name,
                total = score,
                "Low-confidence merge"
            ),
            _ => debug!(
                node_id = %node.id,
                name = %name,
                decision = %decision,
                total = score,
                mention_count = node.mention_count,
                "Merged mention"
            ),
        }
        if effect.promoted {
            info!(node_id = %node.id, canonical = %node.canonical_name, "Promoted canonical name");
        }
    }

    /// Exact folded hit among `nodes`, tie-broken like fuzzy candidates
    fn exact_match<'a>(&self, folded: &str, nodes: &'a [CanonicalNode]) -> Option<&'a CanonicalNode> {
        nodes
            .iter()
            .filter(|node| node.is_active() && node.matches_folded(folded))
            .min_by(|a, b| {
                b.mention_count
                    .cmp(&a.mention_count)
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    /// Score every node and return the highest ranked one above the floor
    pub fn best_candidate(
        &self,
        name: &str,
        nodes: Vec<CanonicalNode>,
        now: DateTime<Utc>,
    ) -> Option<RankedCandidate> {
        let mut candidates = self.rank_candidates(name, nodes, now);
        if candidates.is_empty() {
            return None;
        }
        Some(candidates.swap_remove(0))
    }

    /// Candidates at or above the floor, best first
    pub fn rank_candidates(
        &self,
        name: &str,
        nodes: Vec<CanonicalNode>,
        now: DateTime<Utc>,
    ) -> Vec<RankedCandidate> {
        let mut candidates: Vec<RankedCandidate> = nodes
            .into_iter()
            .filter(CanonicalNode::is_active)
            .filter_map(|node| {
                let score = self.scorer.best_score(name, node.name_variants());
                if score < self.config.candidate_floor {
                    return None;
                }
                let total = score + self.mention_boost(&node) + self.recency_boost(&node, now);
                debug!(candidate = %node.id, score, total, "Scored candidate");
                Some(RankedCandidate { node, score, total })
            })
            .collect();
        candidates.sort_by(compare_candidates);
        candidates
    }

    fn mention_boost(&self, node: &CanonicalNode) -> f64 {
        (node.mention_count as f64 / self.config.mention_boost_divisor)
            .min(self.config.mention_boost_cap)
    }

    fn recency_boost(&self, node: &CanonicalNode, now: DateTime<Utc>) -> f64 {
        (self.config.recency_boost_max
            - node.days_since_seen(now) / self.config.recency_boost_decay_days)
            .max(0.0)
    }

    /// Read-only match: exact first, then best fuzzy candidate by score.
    /// Searches every type when `entity_type` is None.
    pub async fn find_match(
        &self,
        name: &str,
        entity_type: Option<&EntityType>,
    ) -> Result<Option<(CanonicalNode, f64)>> {
        validate_name("name", name)?;
        let folded = fold_name(name);
        let nodes = self.store.list_nodes(entity_type, false).await?;

        if let Some(node) = self.exact_match(&folded, &nodes) {
            return Ok(Some((node.clone(), 1.0)));
        }

        let best = nodes
            .into_iter()
            .map(|node| {
                let score = self.scorer.best_score(name, node.name_variants());
                (node, score)
            })
            .filter(|(_, score)| *score >= self.config.candidate_floor)
            .max_by(|(a, sa), (b, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.mention_count.cmp(&b.mention_count))
                    .then_with(|| b.id.cmp(&a.id))
            });
        Ok(best)
    }
}
