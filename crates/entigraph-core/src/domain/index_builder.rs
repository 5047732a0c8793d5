//! Similarity index builder
//!
//! Batch job: for every active item of one kind, score it against every other
//! item off a single snapshot and cache the top K. Each entry is written on
//! its own, so a cancelled run leaves a usable, partially refreshed index.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::error::Result;

use super::edge::RelationshipEdge;
use super::index::{RebuildReport, SimilarityCandidate, SimilarityIndexEntry};
use super::node::CanonicalNode;
use super::repository::GraphStore;
use super::similarity::{SimilarityScorer, fold_name};
use super::tags::EntityType;

/// Attributes of one item used for comparison
#[derive(Debug, Clone)]
struct ItemFeatures {
    id: String,
    title: String,
    tags: BTreeSet<String>,
    neighbors: BTreeSet<String>,
}

fn jaccard<'a>(a: &'a BTreeSet<String>, b: &'a BTreeSet<String>) -> (f64, Vec<&'a str>) {
    let shared: Vec<&str> = a.intersection(b).map(String::as_str).collect();
    let union = a.union(b).count();
    if union == 0 {
        return (0.0, shared);
    }
    (shared.len() as f64 / union as f64, shared)
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{} {}", count, word)
    } else {
        format!("{} {}s", count, word)
    }
}

/// Precomputes nearest neighbours per item kind
pub struct SimilarityIndexBuilder<S: GraphStore> {
    store: Arc<S>,
    config: IndexConfig,
    scorer: SimilarityScorer,
}

impl<S: GraphStore> SimilarityIndexBuilder<S> {
    pub fn new(store: Arc<S>, config: IndexConfig, scorer: SimilarityScorer) -> Self {
        Self {
            store,
            config,
            scorer,
        }
    }

    fn features(&self, node: &CanonicalNode, edges: &[RelationshipEdge]) -> ItemFeatures {
        let mut tags = BTreeSet::new();
        for key in &self.config.tag_keys {
            match node.metadata.get(key) {
                Some(Value::String(tag)) => {
                    tags.insert(fold_name(tag));
                }
                Some(Value::Array(items)) => {
                    tags.extend(items.iter().filter_map(Value::as_str).map(fold_name));
                }
                _ => {}
            }
        }
        tags.remove("");

        let neighbors = edges
            .iter()
            .filter(|e| e.subject_id == node.id || e.object_id == node.id)
            .map(|e| e.other_end(&node.id).to_string())
            .filter(|other| other != &node.id)
            .collect();

        ItemFeatures {
            id: node.id.clone(),
            title: node.canonical_name.clone(),
            tags,
            neighbors,
        }
    }

    fn compare(&self, subject: &ItemFeatures, other: &ItemFeatures) -> SimilarityCandidate {
        let title = self.scorer.score(&subject.title, &other.title);
        let (tag_score, shared_tags) = jaccard(&subject.tags, &other.tags);
        let (neighbor_score, shared_neighbors) = jaccard(&subject.neighbors, &other.neighbors);

        let c = &self.config;
        let weight_sum = c.title_weight + c.tag_weight + c.neighborhood_weight;
        let score = if weight_sum > 0.0 {
            (c.title_weight * title + c.tag_weight * tag_score + c.neighborhood_weight * neighbor_score)
                / weight_sum
        } else {
            0.0
        };

        let mut reasons = Vec::new();
        if title >= 0.5 {
            reasons.push(format!("similar name ({:.2})", title));
        }
        if !shared_tags.is_empty() {
            reasons.push(format!(
                "{} ({})",
                plural(shared_tags.len(), "shared tag"),
                shared_tags.join(", ")
            ));
        }
        if !shared_neighbors.is_empty() {
            reasons.push(plural(shared_neighbors.len(), "shared connection"));
        }
        if reasons.is_empty() {
            reasons.push(format!("weak name match ({:.2})", title));
        }

        SimilarityCandidate {
            item_id: other.id.clone(),
            score: score.clamp(0.0, 1.0),
            explanation: reasons.join("; "),
        }
    }

    fn top_k(&self, subject: &ItemFeatures, items: &[ItemFeatures]) -> Vec<SimilarityCandidate> {
        let mut candidates: Vec<SimilarityCandidate> = items
            .iter()
            .filter(|other| other.id != subject.id)
            .map(|other| self.compare(subject, other))
            .filter(|candidate| candidate.score >= self.config.min_score)
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        candidates.truncate(self.config.top_k);
        candidates
    }

    async fn snapshot(&self, item_kind: &EntityType) -> Result<Vec<ItemFeatures>> {
        let nodes = self.store.list_nodes(Some(item_kind), false).await?;
        let edges = self.store.list_edges(false).await?;
        Ok(nodes.iter().map(|node| self.features(node, &edges)).collect())
    }

    /// Rebuild every entry of `item_kind`. A cancelled run returns a report
    /// with `completed == false` rather than an error.
    pub async fn rebuild(
        &self,
        item_kind: &EntityType,
        cancel: &CancellationToken,
    ) -> Result<RebuildReport> {
        let items = self.snapshot(item_kind).await?;
        let total = items.len();
        info!(item_kind = %item_kind, total, "Rebuilding similarity index");

        let mut rebuilt = 0;
        for subject in &items {
            if cancel.is_cancelled() {
                warn!(item_kind = %item_kind, rebuilt, total, "Similarity index rebuild cancelled");
                return Ok(RebuildReport {
                    item_kind: item_kind.clone(),
                    rebuilt,
                    total,
                    completed: false,
                });
            }

            let candidates = self.top_k(subject, &items);
            let entry = SimilarityIndexEntry::new(&subject.id, item_kind.clone(), candidates, Utc::now());
            self.store.save_index_entry(&entry).await?;
            rebuilt += 1;
            debug!(subject_id = %subject.id, neighbours = entry.candidates.len(), "Wrote index entry");

            tokio::task::yield_now().await;
        }

        let keep: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let removed = self.store.delete_index_entries_except(item_kind, &keep).await?;

        info!(item_kind = %item_kind, rebuilt, total, removed, "Similarity index rebuilt");
        Ok(RebuildReport {
            item_kind: item_kind.clone(),
            rebuilt,
            total,
            completed: true,
        })
    }

    /// On-the-fly O(n) scan for an item without an index entry
    pub async fn scan(&self, node: &CanonicalNode) -> Result<Vec<SimilarityCandidate>> {
        let nodes = self.store.list_nodes(Some(&node.entity_type), false).await?;
        let edges = self.store.list_edges(false).await?;
        let items: Vec<ItemFeatures> = nodes.iter().map(|n| self.features(n, &edges)).collect();
        let subject = self.features(node, &edges);
        Ok(self.top_k(&subject, &items))
    }
}
