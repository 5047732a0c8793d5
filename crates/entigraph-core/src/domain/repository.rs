//! Persistence seam for the graph
//!
//! Every component takes a `GraphStore` rather than reaching for global
//! state. Writes to nodes, edges and structure rows are optimistic: the store
//! only applies an update when the stored `version` still equals the one the
//! caller read, and reports `ConcurrentUpdateConflict` otherwise.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::edge::RelationshipEdge;
use super::index::SimilarityIndexEntry;
use super::node::{CanonicalNode, MentionRecord};
use super::structure::StructureNode;
use super::tags::{EntityType, Predicate};

/// A most-mentioned entity in the stats output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopEntity {
    pub id: String,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub mention_count: u64,
}

/// Aggregate statistics about the graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Active nodes per entity type
    pub nodes_by_type: BTreeMap<String, u64>,
    /// Active edges per predicate
    pub edges_by_predicate: BTreeMap<String, u64>,
    pub archived_nodes: u64,
    pub archived_edges: u64,
    pub structure_nodes: u64,
    pub index_entries: u64,
    pub stale_index_entries: u64,
    pub top_mentioned: Vec<TopEntity>,
}

impl GraphStats {
    pub fn active_nodes(&self) -> u64 {
        self.nodes_by_type.values().sum()
    }

    pub fn active_edges(&self) -> u64 {
        self.edges_by_predicate.values().sum()
    }
}

/// Storage operations for the knowledge graph
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ========== Canonical nodes ==========

    /// Insert a new node
    async fn insert_node(&self, node: &CanonicalNode) -> Result<()>;

    /// Write `node` if the stored version equals `node.version`; the stored
    /// version becomes `node.version + 1`
    async fn update_node(&self, node: &CanonicalNode) -> Result<()>;

    async fn get_node(&self, id: &str) -> Result<Option<CanonicalNode>>;

    /// Nodes, optionally of one type, optionally including archived ones
    async fn list_nodes(
        &self,
        entity_type: Option<&EntityType>,
        include_archived: bool,
    ) -> Result<Vec<CanonicalNode>>;

    /// Archive active nodes last seen before `cutoff`; returns their ids
    async fn archive_nodes_seen_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    // ========== Relationship edges ==========

    /// Find the edge for a triple, archived or not
    async fn get_edge(
        &self,
        subject_id: &str,
        predicate: &Predicate,
        object_id: &str,
    ) -> Result<Option<RelationshipEdge>>;

    /// Insert a new edge; a duplicate triple is a conflict
    async fn insert_edge(&self, edge: &RelationshipEdge) -> Result<()>;

    /// Optimistic update, same contract as `update_node`
    async fn update_edge(&self, edge: &RelationshipEdge) -> Result<()>;

    /// Active edges where the node is subject or object
    async fn list_edges_for_node(&self, node_id: &str) -> Result<Vec<RelationshipEdge>>;

    async fn list_edges(&self, include_archived: bool) -> Result<Vec<RelationshipEdge>>;

    /// Physically delete edges flagged by a previous prune pass
    async fn delete_pending_edges(&self) -> Result<u64>;

    // ========== Structure nodes ==========

    async fn find_structure(
        &self,
        structure_type: &str,
        name_key: &str,
        parent_key: &str,
    ) -> Result<Option<StructureNode>>;

    /// Active structure nodes with this type and folded name, any parent
    async fn find_structures_by_name(
        &self,
        structure_type: &str,
        name_key: &str,
    ) -> Result<Vec<StructureNode>>;

    async fn get_structure(&self, id: &str) -> Result<Option<StructureNode>>;

    /// Insert; a duplicate (type, name, parent) key is a conflict
    async fn insert_structure(&self, node: &StructureNode) -> Result<()>;

    async fn update_structure(&self, node: &StructureNode) -> Result<()>;

    /// Active structure nodes, optionally of one type
    async fn list_structures(&self, structure_type: Option<&str>) -> Result<Vec<StructureNode>>;

    // ========== Similarity index ==========

    /// Insert or replace the entry for its subject
    async fn save_index_entry(&self, entry: &SimilarityIndexEntry) -> Result<()>;

    async fn get_index_entry(&self, subject_id: &str) -> Result<Option<SimilarityIndexEntry>>;

    /// Flip the stale flag; returns false if no entry exists
    async fn mark_index_stale(&self, subject_id: &str) -> Result<bool>;

    /// Delete entries of `item_kind` whose subject is not in `keep`
    async fn delete_index_entries_except(
        &self,
        item_kind: &EntityType,
        keep: &[String],
    ) -> Result<u64>;

    // ========== Audit trail ==========

    async fn record_mention(&self, mention: &MentionRecord) -> Result<()>;

    /// Oldest first
    async fn mentions_for_node(&self, node_id: &str) -> Result<Vec<MentionRecord>>;

    // ========== Statistics ==========

    async fn stats(&self, top_n: usize) -> Result<GraphStats>;
}
