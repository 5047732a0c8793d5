//! Relationship aggregation
//!
//! Repeated, noisy relationship observations become one confidence-weighted
//! edge per (subject, predicate, object). Both endpoints go through the
//! resolver first, one type lock at a time.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::error::Result;

use super::edge::{RelationshipEdge, StrengthParams};
use super::observation::RelationshipObservation;
use super::repository::GraphStore;
use super::resolver::EntityResolver;
use super::tags::Predicate;

/// Outcome of one decay-and-prune pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecayReport {
    /// Edges physically deleted (flagged by an earlier pass)
    pub purged: u64,
    /// Unreinforced edges whose strength was reduced
    pub decayed: usize,
    /// Edges archived and flagged for deletion in this pass
    pub pruned: usize,
    /// Edges skipped because another writer updated them concurrently
    pub skipped: usize,
}

/// Turns relationship observations into edges
pub struct RelationshipAggregator<S: GraphStore> {
    store: Arc<S>,
    resolver: Arc<EntityResolver<S>>,
    config: AggregatorConfig,
}

impl<S: GraphStore> RelationshipAggregator<S> {
    pub fn new(store: Arc<S>, resolver: Arc<EntityResolver<S>>, config: AggregatorConfig) -> Self {
        Self {
            store,
            resolver,
            config,
        }
    }

    fn params(&self) -> StrengthParams {
        StrengthParams {
            mention_cap: self.config.mention_cap,
            context_cap: self.config.context_cap,
            context_window: self.config.context_window,
        }
    }

    /// Resolve both ends and create or reinforce the edge
    pub async fn observe(&self, observation: &RelationshipObservation) -> Result<RelationshipEdge> {
        self.observe_at(observation, Utc::now()).await
    }

    pub async fn observe_at(
        &self,
        observation: &RelationshipObservation,
        now: DateTime<Utc>,
    ) -> Result<RelationshipEdge> {
        let valid = observation.validate()?;
        let context_id = observation.source_context_id.as_str();
        let empty = Map::new();

        let subject = self
            .resolver
            .resolve(
                &observation.subject,
                &valid.subject_type,
                observation.confidence,
                context_id,
                &empty,
                now,
            )
            .await?
            .node;
        let object = self
            .resolver
            .resolve(
                &observation.object,
                &valid.object_type,
                observation.confidence,
                context_id,
                &empty,
                now,
            )
            .await?
            .node;

        if subject.id == object.id {
            warn!(
                node_id = %subject.id,
                name = %subject.canonical_name,
                predicate = %valid.predicate,
                context_id = %context_id,
                "Reflexive relationship observed, likely an extraction error"
            );
        }

        let mut attempt = 0;
        loop {
            match self
                .try_observe(
                    &subject.id,
                    &valid.predicate,
                    &object.id,
                    observation.confidence,
                    context_id,
                    now,
                )
                .await
            {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        subject_id = %subject.id,
                        predicate = %valid.predicate,
                        object_id = %object.id,
                        attempt,
                        "Retrying edge update after conflict"
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_observe(
        &self,
        subject_id: &str,
        predicate: &Predicate,
        object_id: &str,
        confidence: f64,
        context_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RelationshipEdge> {
        match self.store.get_edge(subject_id, predicate, object_id).await? {
            Some(mut edge) => {
                let revived = edge.reinforce(confidence, context_id, now, self.params());
                self.store.update_edge(&edge).await?;
                edge.version += 1;

                if revived {
                    info!(edge_id = %edge.id, predicate = %predicate, strength = edge.strength, "Revived archived edge");
                    self.mark_endpoints_stale(&edge).await?;
                } else {
                    debug!(
                        edge_id = %edge.id,
                        mention_count = edge.mention_count,
                        context_count = edge.context_count,
                        strength = edge.strength,
                        "Reinforced edge"
                    );
                }
                Ok(edge)
            }
            None => {
                let edge = RelationshipEdge::new(
                    subject_id,
                    predicate.clone(),
                    object_id,
                    confidence,
                    context_id,
                    now,
                );
                self.store.insert_edge(&edge).await?;
                info!(
                    edge_id = %edge.id,
                    subject_id = %subject_id,
                    predicate = %predicate,
                    object_id = %object_id,
                    strength = edge.strength,
                    "Created edge"
                );
                self.mark_endpoints_stale(&edge).await?;
                Ok(edge)
            }
        }
    }

    async fn mark_endpoints_stale(&self, edge: &RelationshipEdge) -> Result<()> {
        self.store.mark_index_stale(&edge.subject_id).await?;
        if !edge.is_reflexive() {
            self.store.mark_index_stale(&edge.object_id).await?;
        }
        Ok(())
    }

    /// Maintenance pass: purge edges flagged last time, decay unreinforced
    /// edges, then archive and flag those that fell below the floor
    pub async fn decay_and_prune(&self, now: DateTime<Utc>) -> Result<DecayReport> {
        let mut report = DecayReport {
            purged: self.store.delete_pending_edges().await?,
            ..Default::default()
        };
        let mut touched = BTreeSet::new();

        for mut edge in self.store.list_edges(false).await? {
            if !edge.is_unreinforced(now, self.config.decay_window_days) {
                continue;
            }

            edge.decay(self.config.decay_factor, now);
            let pruned = edge.strength < self.config.prune_floor;
            if pruned {
                edge.prune(now);
            }

            match self.store.update_edge(&edge).await {
                Ok(()) => {
                    report.decayed += 1;
                    if pruned {
                        report.pruned += 1;
                        debug!(edge_id = %edge.id, strength = edge.strength, "Pruned edge");
                        touched.insert(edge.subject_id.clone());
                        touched.insert(edge.object_id.clone());
                    }
                }
                // Reinforced while we were decaying it; the fresh state wins
                Err(e) if e.is_retryable() => {
                    report.skipped += 1;
                    debug!(edge_id = %edge.id, "Skipped decay of concurrently updated edge");
                }
                Err(e) => return Err(e),
            }
        }

        for node_id in &touched {
            self.store.mark_index_stale(node_id).await?;
        }

        info!(
            purged = report.purged,
            decayed = report.decayed,
            pruned = report.pruned,
            skipped = report.skipped,
            "Decay pass complete"
        );
        Ok(report)
    }
}
