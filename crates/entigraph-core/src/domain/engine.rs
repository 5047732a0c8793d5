//! Knowledge graph engine facade
//!
//! Wires resolver, aggregator, structure learner and index builder over one
//! store and exposes what the application layer and the maintenance scheduler
//! call: batch ingest, read-only queries, and the maintenance passes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

use super::aggregator::{DecayReport, RelationshipAggregator};
use super::edge::RelationshipEdge;
use super::index::{RebuildReport, SimilarityLookup};
use super::index_builder::SimilarityIndexBuilder;
use super::locks::TypeLocks;
use super::node::{CanonicalNode, MentionRecord, MergeDecision};
use super::observation::{
    IngestReport, ObservationBatch, RecordKind, RejectedRecord, RelationshipObservation,
    StructureObservation, validate_name,
};
use super::repository::{GraphStats, GraphStore};
use super::resolver::EntityResolver;
use super::structure::{StructureNode, StructureTree};
use super::structure_learner::StructureLearner;
use super::tags::EntityType;

/// An edge together with the display name of its far end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeView {
    pub edge: RelationshipEdge,
    pub other_id: String,
    pub other_name: String,
}

/// Result of a lookup by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node: CanonicalNode,
    /// 1.0 for exact or alias hits, the fuzzy score otherwise
    pub match_score: f64,
    pub outgoing: Vec<EdgeView>,
    pub incoming: Vec<EdgeView>,
}

/// One fuzzy search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub node: CanonicalNode,
    pub score: f64,
}

/// Audit trail for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExplanation {
    pub node: CanonicalNode,
    /// Oldest first
    pub mentions: Vec<MentionRecord>,
}

impl NodeExplanation {
    pub fn flagged(&self) -> impl Iterator<Item = &MentionRecord> {
        self.mentions.iter().filter(|m| m.is_flagged())
    }
}

/// Outcome of an archive-stale-nodes pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub archived: Vec<String>,
    pub cutoff: Option<DateTime<Utc>>,
}

/// The knowledge graph engine
pub struct KnowledgeGraphEngine<S: GraphStore> {
    store: Arc<S>,
    config: EngineConfig,
    resolver: Arc<EntityResolver<S>>,
    aggregator: RelationshipAggregator<S>,
    learner: StructureLearner<S>,
    index_builder: SimilarityIndexBuilder<S>,
}

impl<S: GraphStore> KnowledgeGraphEngine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self::with_locks(store, config, TypeLocks::new())
    }

    /// Engines sharing a store in one process should share locks too
    pub fn with_locks(store: Arc<S>, config: EngineConfig, locks: TypeLocks) -> Self {
        let resolver = Arc::new(
            EntityResolver::new(store.clone(), config.resolver.clone()).with_locks(locks),
        );
        let aggregator =
            RelationshipAggregator::new(store.clone(), resolver.clone(), config.aggregator.clone());
        let learner = StructureLearner::new(store.clone(), &config.aggregator);
        let index_builder =
            SimilarityIndexBuilder::new(store.clone(), config.index.clone(), *resolver.scorer());

        Self {
            store,
            config,
            resolver,
            aggregator,
            learner,
            index_builder,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &EntityResolver<S> {
        &self.resolver
    }

    // ========== Observation ==========

    pub async fn resolve_or_create(
        &self,
        name: &str,
        entity_type: &EntityType,
        confidence: f64,
        context_id: &str,
    ) -> Result<CanonicalNode> {
        self.resolver
            .resolve_or_create(name, entity_type, confidence, context_id)
            .await
    }

    pub async fn observe_relationship(
        &self,
        observation: &RelationshipObservation,
    ) -> Result<RelationshipEdge> {
        self.aggregator.observe(observation).await
    }

    pub async fn observe_structure(&self, observation: &StructureObservation) -> Result<StructureNode> {
        self.learner.observe_structure(observation).await
    }

    /// Process a batch: entities, then relationships, then structure metadata
    /// attached to entities. Records fail independently.
    pub async fn ingest(&self, batch: &ObservationBatch) -> IngestReport {
        let now = Utc::now();
        let mut report = IngestReport::default();
        if batch.is_empty() {
            debug!("Skipping empty observation batch");
            return report;
        }
        let mut structures = Vec::new();

        for observation in &batch.entities {
            let resolved = match observation.validate() {
                Ok(entity_type) => {
                    self.resolver
                        .resolve(
                            &observation.name,
                            &entity_type,
                            observation.confidence,
                            &observation.source_context_id,
                            &observation.metadata,
                            now,
                        )
                        .await
                }
                Err(e) => Err(e),
            };

            match resolved {
                Ok(resolution) => {
                    report.entities_resolved += 1;
                    match resolution.decision {
                        MergeDecision::Created => report.nodes_created += 1,
                        MergeDecision::LowConfidenceMerge => report.low_confidence_merges += 1,
                        _ => {}
                    }
                    if let Some(metadata) = &observation.structure {
                        structures.push(StructureObservation::from_metadata(
                            metadata,
                            &observation.source_context_id,
                            Some(resolution.node.id.clone()),
                        ));
                    }
                }
                Err(e) => report.rejected.push(reject(RecordKind::Entity, observation, &e)),
            }
        }

        for observation in &batch.relationships {
            match self.aggregator.observe_at(observation, now).await {
                Ok(_) => report.relationships_observed += 1,
                Err(e) => report
                    .rejected
                    .push(reject(RecordKind::Relationship, observation, &e)),
            }
        }

        for observation in &structures {
            match self.learner.observe_structure_at(observation, now).await {
                Ok(_) => report.structures_observed += 1,
                Err(e) => report
                    .rejected
                    .push(reject(RecordKind::Structure, observation, &e)),
            }
        }

        info!(
            entities = report.entities_resolved,
            created = report.nodes_created,
            low_confidence = report.low_confidence_merges,
            relationships = report.relationships_observed,
            structures = report.structures_observed,
            rejected = report.rejected.len(),
            "Ingested observation batch"
        );
        report
    }

    // ========== Queries ==========

    pub async fn get_node(&self, id: &str) -> Result<CanonicalNode> {
        self.store
            .get_node(id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Exact, alias or fuzzy lookup with edges at or above `min_strength`
    pub async fn lookup(
        &self,
        name: &str,
        entity_type: Option<&EntityType>,
        min_strength: f64,
    ) -> Result<Option<NodeView>> {
        let Some((node, match_score)) = self.resolver.find_match(name, entity_type).await? else {
            return Ok(None);
        };

        let mut outgoing = Vec::new();
        let mut incoming = Vec::new();
        for edge in self.store.list_edges_for_node(&node.id).await? {
            if edge.strength < min_strength {
                continue;
            }
            let is_outgoing = edge.subject_id == node.id;
            let other_id = edge.other_end(&node.id).to_string();
            let other_name = match self.store.get_node(&other_id).await? {
                Some(other) => other.canonical_name,
                None => other_id.clone(),
            };
            let view = EdgeView {
                edge,
                other_id,
                other_name,
            };
            if is_outgoing {
                outgoing.push(view);
            } else {
                incoming.push(view);
            }
        }

        let by_strength = |a: &EdgeView, b: &EdgeView| {
            b.edge
                .strength
                .partial_cmp(&a.edge.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        };
        outgoing.sort_by(by_strength);
        incoming.sort_by(by_strength);

        Ok(Some(NodeView {
            node,
            match_score,
            outgoing,
            incoming,
        }))
    }

    /// Ranked fuzzy search over canonical names and aliases
    pub async fn search(
        &self,
        query: &str,
        entity_type: Option<&EntityType>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        validate_name("search query", query)?;
        let scorer = self.resolver.scorer();

        let mut hits: Vec<SearchHit> = self
            .store
            .list_nodes(entity_type, false)
            .await?
            .into_iter()
            .filter_map(|node| {
                let score = scorer.best_score(query, node.name_variants());
                (score >= self.config.search.min_score).then_some(SearchHit { node, score })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.node.mention_count.cmp(&a.node.mention_count))
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    pub async fn hierarchy(&self, structure_type: Option<&str>) -> Result<Vec<StructureTree>> {
        self.learner.hierarchy(structure_type).await
    }

    pub async fn stats(&self, top_n: usize) -> Result<GraphStats> {
        self.store.stats(top_n).await
    }

    /// Related items: O(1) from the index, or an O(n) scan without an entry
    pub async fn similar_items(&self, item_id: &str) -> Result<SimilarityLookup> {
        if let Some(entry) = self.store.get_index_entry(item_id).await? {
            return Ok(entry.into());
        }

        let node = self.get_node(item_id).await?;
        let candidates = self.index_builder.scan(&node).await?;
        Ok(SimilarityLookup {
            subject_id: node.id,
            candidates,
            stale: true,
            computed_at: None,
            from_index: false,
        })
    }

    pub async fn explain_node(&self, node_id: &str) -> Result<NodeExplanation> {
        let node = self.get_node(node_id).await?;
        let mentions = self.store.mentions_for_node(node_id).await?;
        Ok(NodeExplanation { node, mentions })
    }

    // ========== Maintenance ==========

    pub async fn decay_and_prune(&self, now: DateTime<Utc>) -> Result<DecayReport> {
        self.aggregator.decay_and_prune(now).await
    }

    /// Archive nodes not mentioned within the retention window
    pub async fn archive_stale_nodes(&self, now: DateTime<Utc>) -> Result<ArchiveReport> {
        let days = self.config.retention.node_retention_days;
        let cutoff = Duration::try_days(days)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| {
                Error::ConfigError(format!("retention.node_retention_days {} is out of range", days))
            })?;
        let archived = self.store.archive_nodes_seen_before(cutoff, now).await?;
        for node_id in &archived {
            self.store.mark_index_stale(node_id).await?;
        }
        info!(archived = archived.len(), cutoff = %cutoff, "Archived stale nodes");
        Ok(ArchiveReport {
            archived,
            cutoff: Some(cutoff),
        })
    }

    pub async fn rebuild_index(
        &self,
        item_kind: &EntityType,
        cancel: &CancellationToken,
    ) -> Result<RebuildReport> {
        self.index_builder.rebuild(item_kind, cancel).await
    }

    pub async fn archive_structure(&self, id: &str) -> Result<StructureNode> {
        self.learner.archive_structure(id, Utc::now()).await
    }
}

/// Log a rejected record with its raw form and build the report entry
fn reject<T: Serialize>(kind: RecordKind, record: &T, error: &Error) -> RejectedRecord {
    let raw = serde_json::to_value(record).unwrap_or(Value::Null);
    warn!(
        kind = ?kind,
        code = error.code(),
        error = %error,
        record = %raw,
        "Rejected observation"
    );
    RejectedRecord {
        kind,
        record: raw,
        code: error.code().to_string(),
        error: error.to_string(),
    }
}
