//! SQLite implementation of the graph store

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::domain::edge::{ContextWindow, RelationshipEdge};
use crate::domain::index::{SimilarityCandidate, SimilarityIndexEntry};
use crate::domain::node::{CanonicalNode, MentionRecord, MergeDecision};
use crate::domain::repository::{GraphStats, GraphStore, TopEntity};
use crate::domain::structure::StructureNode;
use crate::domain::tags::{EntityType, Predicate};
use crate::error::{Error, Result};

/// SQLite-backed graph store
#[derive(Clone)]
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Fixed-width UTC timestamp so text comparison matches time order
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Invalid timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

fn count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Zero rows on a versioned update means someone else wrote first
fn check_versioned(rows_affected: u64, what: &str, id: &str, version: i64) -> Result<()> {
    if rows_affected == 0 {
        return Err(Error::ConcurrentUpdateConflict(format!(
            "{} {} changed since version {}",
            what, id, version
        )));
    }
    Ok(())
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    // ========== Canonical nodes ==========

    async fn insert_node(&self, node: &CanonicalNode) -> Result<()> {
        let aliases = to_json(&node.aliases)?;
        let metadata = to_json(&node.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO canonical_nodes (
                id, canonical_name, entity_type, aliases, first_seen, last_seen,
                mention_count, confidence, metadata, archived_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&node.canonical_name)
        .bind(node.entity_type.as_str())
        .bind(&aliases)
        .bind(ts(node.first_seen))
        .bind(ts(node.last_seen))
        .bind(count(node.mention_count))
        .bind(node.confidence)
        .bind(&metadata)
        .bind(node.archived_at.map(ts))
        .bind(node.version)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::from_insert(e, format!("node {} already exists", node.id)))?;

        Ok(())
    }

    async fn update_node(&self, node: &CanonicalNode) -> Result<()> {
        let aliases = to_json(&node.aliases)?;
        let metadata = to_json(&node.metadata)?;

        let result = sqlx::query(
            r#"
            UPDATE canonical_nodes SET
                canonical_name = ?, entity_type = ?, aliases = ?, first_seen = ?,
                last_seen = ?, mention_count = ?, confidence = ?, metadata = ?,
                archived_at = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&node.canonical_name)
        .bind(node.entity_type.as_str())
        .bind(&aliases)
        .bind(ts(node.first_seen))
        .bind(ts(node.last_seen))
        .bind(count(node.mention_count))
        .bind(node.confidence)
        .bind(&metadata)
        .bind(node.archived_at.map(ts))
        .bind(&node.id)
        .bind(node.version)
        .execute(&self.pool)
        .await?;

        check_versioned(result.rows_affected(), "Node", &node.id, node.version)
    }

    async fn get_node(&self, id: &str) -> Result<Option<CanonicalNode>> {
        let row: Option<NodeRow> = sqlx::query_as("SELECT * FROM canonical_nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_node()).transpose()
    }

    async fn list_nodes(
        &self,
        entity_type: Option<&EntityType>,
        include_archived: bool,
    ) -> Result<Vec<CanonicalNode>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM canonical_nodes WHERE 1 = 1");
        if let Some(entity_type) = entity_type {
            query.push(" AND entity_type = ");
            query.push_bind(entity_type.as_str().to_string());
        }
        if !include_archived {
            query.push(" AND archived_at IS NULL");
        }
        query.push(" ORDER BY first_seen, id");

        let rows: Vec<NodeRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_node()).collect()
    }

    async fn archive_nodes_seen_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE canonical_nodes
            SET archived_at = ?, version = version + 1
            WHERE archived_at IS NULL AND last_seen < ?
            RETURNING id
            "#,
        )
        .bind(ts(now))
        .bind(ts(cutoff))
        .fetch_all(&self.pool)
        .await?;

        let mut ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        ids.sort();
        Ok(ids)
    }

    // ========== Relationship edges ==========

    async fn get_edge(
        &self,
        subject_id: &str,
        predicate: &Predicate,
        object_id: &str,
    ) -> Result<Option<RelationshipEdge>> {
        let row: Option<EdgeRow> = sqlx::query_as(
            "SELECT * FROM relationship_edges WHERE subject_id = ? AND predicate = ? AND object_id = ?",
        )
        .bind(subject_id)
        .bind(predicate.as_str())
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_edge()).transpose()
    }

    async fn insert_edge(&self, edge: &RelationshipEdge) -> Result<()> {
        let contexts = to_json(&edge.recent_contexts)?;

        sqlx::query(
            r#"
            INSERT INTO relationship_edges (
                id, subject_id, predicate, object_id, strength, mention_count,
                context_count, confidence, recent_contexts, first_seen, last_seen,
                last_decayed_at, archived_at, pending_delete, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&edge.id)
        .bind(&edge.subject_id)
        .bind(edge.predicate.as_str())
        .bind(&edge.object_id)
        .bind(edge.strength)
        .bind(count(edge.mention_count))
        .bind(count(edge.context_count))
        .bind(edge.confidence)
        .bind(&contexts)
        .bind(ts(edge.first_seen))
        .bind(ts(edge.last_seen))
        .bind(edge.last_decayed_at.map(ts))
        .bind(edge.archived_at.map(ts))
        .bind(edge.pending_delete)
        .bind(edge.version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::from_insert(
                e,
                format!(
                    "edge {} -[{}]-> {} already exists",
                    edge.subject_id, edge.predicate, edge.object_id
                ),
            )
        })?;

        Ok(())
    }

    async fn update_edge(&self, edge: &RelationshipEdge) -> Result<()> {
        let contexts = to_json(&edge.recent_contexts)?;

        let result = sqlx::query(
            r#"
            UPDATE relationship_edges SET
                strength = ?, mention_count = ?, context_count = ?, confidence = ?,
                recent_contexts = ?, first_seen = ?, last_seen = ?, last_decayed_at = ?,
                archived_at = ?, pending_delete = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(edge.strength)
        .bind(count(edge.mention_count))
        .bind(count(edge.context_count))
        .bind(edge.confidence)
        .bind(&contexts)
        .bind(ts(edge.first_seen))
        .bind(ts(edge.last_seen))
        .bind(edge.last_decayed_at.map(ts))
        .bind(edge.archived_at.map(ts))
        .bind(edge.pending_delete)
        .bind(&edge.id)
        .bind(edge.version)
        .execute(&self.pool)
        .await?;

        check_versioned(result.rows_affected(), "Edge", &edge.id, edge.version)
    }

    async fn list_edges_for_node(&self, node_id: &str) -> Result<Vec<RelationshipEdge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(
            r#"
            SELECT * FROM relationship_edges
            WHERE (subject_id = ? OR object_id = ?) AND archived_at IS NULL
            ORDER BY strength DESC, id
            "#,
        )
        .bind(node_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_edge()).collect()
    }

    async fn list_edges(&self, include_archived: bool) -> Result<Vec<RelationshipEdge>> {
        let sql = if include_archived {
            "SELECT * FROM relationship_edges ORDER BY first_seen, id"
        } else {
            "SELECT * FROM relationship_edges WHERE archived_at IS NULL ORDER BY first_seen, id"
        };
        let rows: Vec<EdgeRow> = sqlx::query_as(sql).fetch_all(&self.pool).await?;

        rows.into_iter().map(|r| r.into_edge()).collect()
    }

    async fn delete_pending_edges(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM relationship_edges WHERE pending_delete = 1")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ========== Structure nodes ==========

    async fn find_structure(
        &self,
        structure_type: &str,
        name_key: &str,
        parent_key: &str,
    ) -> Result<Option<StructureNode>> {
        let row: Option<StructureRow> = sqlx::query_as(
            r#"
            SELECT * FROM structure_nodes
            WHERE structure_type = ? AND name_key = ? AND parent_key = ?
            "#,
        )
        .bind(structure_type)
        .bind(name_key)
        .bind(parent_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_structure()).transpose()
    }

    async fn find_structures_by_name(
        &self,
        structure_type: &str,
        name_key: &str,
    ) -> Result<Vec<StructureNode>> {
        let rows: Vec<StructureRow> = sqlx::query_as(
            r#"
            SELECT * FROM structure_nodes
            WHERE structure_type = ? AND name_key = ? AND archived_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .bind(structure_type)
        .bind(name_key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_structure()).collect()
    }

    async fn get_structure(&self, id: &str) -> Result<Option<StructureNode>> {
        let row: Option<StructureRow> = sqlx::query_as("SELECT * FROM structure_nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_structure()).transpose()
    }

    async fn insert_structure(&self, node: &StructureNode) -> Result<()> {
        let contexts = to_json(&node.recent_contexts)?;
        let associated = to_json(&node.associated_node_ids)?;

        sqlx::query(
            r#"
            INSERT INTO structure_nodes (
                id, structure_type, name, name_key, parent_id, parent_key,
                mention_count, context_count, recent_contexts, associated_node_ids,
                created_at, updated_at, archived_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&node.structure_type)
        .bind(&node.name)
        .bind(&node.name_key)
        .bind(node.parent_id.as_deref())
        .bind(node.parent_key())
        .bind(count(node.mention_count))
        .bind(count(node.context_count))
        .bind(&contexts)
        .bind(&associated)
        .bind(ts(node.created_at))
        .bind(ts(node.updated_at))
        .bind(node.archived_at.map(ts))
        .bind(node.version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::from_insert(
                e,
                format!("structure {} '{}' already exists", node.structure_type, node.name),
            )
        })?;

        Ok(())
    }

    async fn update_structure(&self, node: &StructureNode) -> Result<()> {
        let contexts = to_json(&node.recent_contexts)?;
        let associated = to_json(&node.associated_node_ids)?;

        let result = sqlx::query(
            r#"
            UPDATE structure_nodes SET
                name = ?, parent_id = ?, parent_key = ?, mention_count = ?,
                context_count = ?, recent_contexts = ?, associated_node_ids = ?,
                updated_at = ?, archived_at = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&node.name)
        .bind(node.parent_id.as_deref())
        .bind(node.parent_key())
        .bind(count(node.mention_count))
        .bind(count(node.context_count))
        .bind(&contexts)
        .bind(&associated)
        .bind(ts(node.updated_at))
        .bind(node.archived_at.map(ts))
        .bind(&node.id)
        .bind(node.version)
        .execute(&self.pool)
        .await
        // re-parenting onto an occupied key collides with the unique index
        .map_err(|e| {
            Error::from_insert(
                e,
                format!("structure {} '{}' already exists", node.structure_type, node.name),
            )
        })?;

        check_versioned(result.rows_affected(), "Structure", &node.id, node.version)
    }

    async fn list_structures(&self, structure_type: Option<&str>) -> Result<Vec<StructureNode>> {
        let rows: Vec<StructureRow> = match structure_type {
            Some(structure_type) => {
                sqlx::query_as(
                    r#"
                    SELECT * FROM structure_nodes
                    WHERE structure_type = ? AND archived_at IS NULL
                    ORDER BY name_key, id
                    "#,
                )
                .bind(structure_type)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM structure_nodes WHERE archived_at IS NULL ORDER BY name_key, id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(|r| r.into_structure()).collect()
    }

    // ========== Similarity index ==========

    async fn save_index_entry(&self, entry: &SimilarityIndexEntry) -> Result<()> {
        let candidates = to_json(&entry.candidates)?;

        sqlx::query(
            r#"
            INSERT INTO similarity_index (subject_id, item_kind, candidates, computed_at, stale)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(subject_id) DO UPDATE SET
                item_kind = excluded.item_kind,
                candidates = excluded.candidates,
                computed_at = excluded.computed_at,
                stale = excluded.stale
            "#,
        )
        .bind(&entry.subject_id)
        .bind(entry.item_kind.as_str())
        .bind(&candidates)
        .bind(ts(entry.computed_at))
        .bind(entry.stale)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_index_entry(&self, subject_id: &str) -> Result<Option<SimilarityIndexEntry>> {
        let row: Option<IndexRow> =
            sqlx::query_as("SELECT * FROM similarity_index WHERE subject_id = ?")
                .bind(subject_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| r.into_entry()).transpose()
    }

    async fn mark_index_stale(&self, subject_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE similarity_index SET stale = 1 WHERE subject_id = ?")
            .bind(subject_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_index_entries_except(
        &self,
        item_kind: &EntityType,
        keep: &[String],
    ) -> Result<u64> {
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM similarity_index WHERE item_kind = ");
        query.push_bind(item_kind.as_str().to_string());
        if !keep.is_empty() {
            query.push(" AND subject_id NOT IN (");
            let mut ids = query.separated(", ");
            for id in keep {
                ids.push_bind(id.clone());
            }
            ids.push_unseparated(")");
        }

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // ========== Audit trail ==========

    async fn record_mention(&self, mention: &MentionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_mentions (node_id, context_id, raw_name, decision, score, observed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&mention.node_id)
        .bind(&mention.context_id)
        .bind(&mention.raw_name)
        .bind(mention.decision.as_str())
        .bind(mention.score)
        .bind(ts(mention.observed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mentions_for_node(&self, node_id: &str) -> Result<Vec<MentionRecord>> {
        let rows: Vec<MentionRow> = sqlx::query_as(
            r#"
            SELECT node_id, context_id, raw_name, decision, score, observed_at
            FROM node_mentions
            WHERE node_id = ?
            ORDER BY observed_at, id
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_mention()).collect()
    }

    // ========== Statistics ==========

    async fn stats(&self, top_n: usize) -> Result<GraphStats> {
        let nodes_by_type: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT entity_type, COUNT(*) FROM canonical_nodes
            WHERE archived_at IS NULL
            GROUP BY entity_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let edges_by_predicate: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT predicate, COUNT(*) FROM relationship_edges
            WHERE archived_at IS NULL
            GROUP BY predicate
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let (archived_nodes,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM canonical_nodes WHERE archived_at IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        let (archived_edges,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM relationship_edges WHERE archived_at IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        let (structure_nodes,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM structure_nodes WHERE archived_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        let (index_entries, stale_index_entries): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), SUM(stale) FROM similarity_index")
                .fetch_one(&self.pool)
                .await?;

        let top: Vec<(String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, canonical_name, entity_type, mention_count FROM canonical_nodes
            WHERE archived_at IS NULL
            ORDER BY mention_count DESC, canonical_name, id
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(top_n).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let top_mentioned = top
            .into_iter()
            .map(|(id, canonical_name, entity_type, mention_count)| {
                Ok(TopEntity {
                    id,
                    canonical_name,
                    entity_type: EntityType::parse(&entity_type)?,
                    mention_count: mention_count.max(0) as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(GraphStats {
            nodes_by_type: nodes_by_type
                .into_iter()
                .map(|(t, c)| (t, c.max(0) as u64))
                .collect(),
            edges_by_predicate: edges_by_predicate
                .into_iter()
                .map(|(p, c)| (p, c.max(0) as u64))
                .collect(),
            archived_nodes: archived_nodes.max(0) as u64,
            archived_edges: archived_edges.max(0) as u64,
            structure_nodes: structure_nodes.max(0) as u64,
            index_entries: index_entries.max(0) as u64,
            stale_index_entries: stale_index_entries.unwrap_or(0).max(0) as u64,
            top_mentioned,
        })
    }
}

// ========== Database Row Types ==========

#[derive(Debug, FromRow)]
struct NodeRow {
    id: String,
    canonical_name: String,
    entity_type: String,
    aliases: String,
    first_seen: String,
    last_seen: String,
    mention_count: i64,
    confidence: f64,
    metadata: String,
    archived_at: Option<String>,
    version: i64,
}

impl NodeRow {
    fn into_node(self) -> Result<CanonicalNode> {
        let aliases: BTreeSet<String> = from_json(&self.aliases)?;
        let metadata: Map<String, Value> = from_json(&self.metadata)?;

        Ok(CanonicalNode {
            entity_type: EntityType::parse(&self.entity_type)?,
            first_seen: parse_ts(&self.first_seen)?,
            last_seen: parse_ts(&self.last_seen)?,
            archived_at: parse_opt_ts(self.archived_at)?,
            id: self.id,
            canonical_name: self.canonical_name,
            aliases,
            mention_count: self.mention_count.max(0) as u64,
            confidence: self.confidence,
            metadata,
            version: self.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct EdgeRow {
    id: String,
    subject_id: String,
    predicate: String,
    object_id: String,
    strength: f64,
    mention_count: i64,
    context_count: i64,
    confidence: f64,
    recent_contexts: String,
    first_seen: String,
    last_seen: String,
    last_decayed_at: Option<String>,
    archived_at: Option<String>,
    pending_delete: bool,
    version: i64,
}

impl EdgeRow {
    fn into_edge(self) -> Result<RelationshipEdge> {
        let recent_contexts: ContextWindow = from_json(&self.recent_contexts)?;

        Ok(RelationshipEdge {
            predicate: Predicate::parse(&self.predicate)?,
            first_seen: parse_ts(&self.first_seen)?,
            last_seen: parse_ts(&self.last_seen)?,
            last_decayed_at: parse_opt_ts(self.last_decayed_at)?,
            archived_at: parse_opt_ts(self.archived_at)?,
            id: self.id,
            subject_id: self.subject_id,
            object_id: self.object_id,
            strength: self.strength,
            mention_count: self.mention_count.max(0) as u64,
            context_count: self.context_count.max(0) as u64,
            confidence: self.confidence,
            recent_contexts,
            pending_delete: self.pending_delete,
            version: self.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct StructureRow {
    id: String,
    structure_type: String,
    name: String,
    name_key: String,
    parent_id: Option<String>,
    mention_count: i64,
    context_count: i64,
    recent_contexts: String,
    associated_node_ids: String,
    created_at: String,
    updated_at: String,
    archived_at: Option<String>,
    version: i64,
}

impl StructureRow {
    fn into_structure(self) -> Result<StructureNode> {
        let recent_contexts: ContextWindow = from_json(&self.recent_contexts)?;
        let associated_node_ids: BTreeSet<String> =
            from_json(&self.associated_node_ids)?;

        Ok(StructureNode {
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            archived_at: parse_opt_ts(self.archived_at)?,
            id: self.id,
            structure_type: self.structure_type,
            name: self.name,
            name_key: self.name_key,
            parent_id: self.parent_id,
            mention_count: self.mention_count.max(0) as u64,
            context_count: self.context_count.max(0) as u64,
            recent_contexts,
            associated_node_ids,
            version: self.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct IndexRow {
    subject_id: String,
    item_kind: String,
    candidates: String,
    computed_at: String,
    stale: bool,
}

impl IndexRow {
    fn into_entry(self) -> Result<SimilarityIndexEntry> {
        let candidates: Vec<SimilarityCandidate> = from_json(&self.candidates)?;

        Ok(SimilarityIndexEntry {
            item_kind: EntityType::parse(&self.item_kind)?,
            computed_at: parse_ts(&self.computed_at)?,
            subject_id: self.subject_id,
            candidates,
            stale: self.stale,
        })
    }
}

#[derive(Debug, FromRow)]
struct MentionRow {
    node_id: String,
    context_id: String,
    raw_name: String,
    decision: String,
    score: f64,
    observed_at: String,
}

impl MentionRow {
    fn into_mention(self) -> Result<MentionRecord> {
        let decision = MergeDecision::parse(&self.decision)
            .ok_or_else(|| Error::Other(format!("Invalid merge decision: {}", self.decision)))?;

        Ok(MentionRecord {
            observed_at: parse_ts(&self.observed_at)?,
            node_id: self.node_id,
            context_id: self.context_id,
            raw_name: self.raw_name,
            decision,
            score: self.score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqliteGraphStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");

        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        SqliteGraphStore::new(pool)
    }

    fn person(name: &str) -> CanonicalNode {
        CanonicalNode::new(name, EntityType::Person, 0.9, Utc::now())
    }

    #[tokio::test]
    async fn test_insert_and_get_node() {
        let store = setup_test_db().await;

        let mut node = person("Jane Doe");
        node.aliases.insert("J. Doe".to_string());
        node.metadata.insert("team".to_string(), Value::from("search"));
        store.insert_node(&node).await.unwrap();

        let loaded = store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded, node);
        assert!(store.get_node("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_json_column_is_serialization_error() {
        let store = setup_test_db().await;
        let node = person("Jane Doe");
        store.insert_node(&node).await.unwrap();

        sqlx::query("UPDATE canonical_nodes SET aliases = '{not json' WHERE id = ?")
            .bind(&node.id)
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.get_node(&node.id).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(err.code(), "E401");
    }

    #[tokio::test]
    async fn test_duplicate_node_is_conflict() {
        let store = setup_test_db().await;
        let node = person("Jane Doe");
        store.insert_node(&node).await.unwrap();

        let err = store.insert_node(&node).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentUpdateConflict(_)));
    }

    #[tokio::test]
    async fn test_update_node_checks_version() {
        let store = setup_test_db().await;
        let mut node = person("Jane Doe");
        store.insert_node(&node).await.unwrap();

        let stale_copy = node.clone();

        node.mention_count = 2;
        store.update_node(&node).await.unwrap();
        let loaded = store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.mention_count, 2);

        let err = store.update_node(&stale_copy).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentUpdateConflict(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_nodes_filters() {
        let store = setup_test_db().await;
        let jane = person("Jane Doe");
        let mut archived = person("Old Timer");
        archived.archive(Utc::now());
        let project = CanonicalNode::new("Apollo", EntityType::Project, 0.8, Utc::now());
        for node in [&jane, &archived, &project] {
            store.insert_node(node).await.unwrap();
        }

        let active_people = store.list_nodes(Some(&EntityType::Person), false).await.unwrap();
        assert_eq!(active_people.len(), 1);
        assert_eq!(active_people[0].id, jane.id);

        let all_people = store.list_nodes(Some(&EntityType::Person), true).await.unwrap();
        assert_eq!(all_people.len(), 2);

        let everything = store.list_nodes(None, false).await.unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn test_archive_nodes_seen_before() {
        let store = setup_test_db().await;
        let now = Utc::now();

        let mut old = person("Old Timer");
        old.last_seen = now - Duration::days(200);
        let fresh = person("Fresh Face");
        store.insert_node(&old).await.unwrap();
        store.insert_node(&fresh).await.unwrap();

        let archived = store
            .archive_nodes_seen_before(now - Duration::days(180), now)
            .await
            .unwrap();
        assert_eq!(archived, vec![old.id.clone()]);

        let loaded = store.get_node(&old.id).await.unwrap().unwrap();
        assert!(loaded.archived_at.is_some());
        assert_eq!(loaded.version, 1);

        // already archived nodes are not reported twice
        let again = store
            .archive_nodes_seen_before(now - Duration::days(180), now)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_edge_lifecycle() {
        let store = setup_test_db().await;
        let jane = person("Jane Doe");
        let john = person("John Smith");
        store.insert_node(&jane).await.unwrap();
        store.insert_node(&john).await.unwrap();

        let mut edge = RelationshipEdge::new(
            &jane.id,
            Predicate::CommunicatesWith,
            &john.id,
            0.7,
            "msg-1",
            Utc::now(),
        );
        store.insert_edge(&edge).await.unwrap();

        let loaded = store
            .get_edge(&jane.id, &Predicate::CommunicatesWith, &john.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, edge);

        let duplicate = RelationshipEdge::new(
            &jane.id,
            Predicate::CommunicatesWith,
            &john.id,
            0.5,
            "msg-2",
            Utc::now(),
        );
        let err = store.insert_edge(&duplicate).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentUpdateConflict(_)));

        assert_eq!(store.list_edges_for_node(&john.id).await.unwrap().len(), 1);

        edge.prune(Utc::now());
        store.update_edge(&edge).await.unwrap();
        assert!(store.list_edges_for_node(&john.id).await.unwrap().is_empty());
        assert_eq!(store.list_edges(true).await.unwrap().len(), 1);
        assert!(store.list_edges(false).await.unwrap().is_empty());

        assert_eq!(store.delete_pending_edges().await.unwrap(), 1);
        assert!(store.list_edges(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_structure_key_is_unique_per_parent() {
        let store = setup_test_db().await;
        let now = Utc::now();

        let root = StructureNode::new("division", "Engineering", None, now);
        store.insert_structure(&root).await.unwrap();

        let team = StructureNode::new("team", "Search", Some(root.id.clone()), now);
        store.insert_structure(&team).await.unwrap();

        let same_name_root = StructureNode::new("team", "Search", None, now);
        store.insert_structure(&same_name_root).await.unwrap();

        let duplicate = StructureNode::new("team", "search", Some(root.id.clone()), now);
        let err = store.insert_structure(&duplicate).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentUpdateConflict(_)));

        let found = store
            .find_structure("team", &team.name_key, &root.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, team.id);

        let by_name = store
            .find_structures_by_name("team", &team.name_key)
            .await
            .unwrap();
        assert_eq!(by_name.len(), 2);

        assert_eq!(store.list_structures(Some("team")).await.unwrap().len(), 2);
        assert_eq!(store.list_structures(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_structure_round_trip() {
        let store = setup_test_db().await;
        let now = Utc::now();
        let mut team = StructureNode::new("team", "Search", None, now);
        store.insert_structure(&team).await.unwrap();

        team.record_observation("doc-1", Some("node-1"), 32, now);
        store.update_structure(&team).await.unwrap();
        team.version += 1;

        let loaded = store.get_structure(&team.id).await.unwrap().unwrap();
        assert_eq!(loaded, team);

        let mut stale = loaded.clone();
        stale.version -= 1;
        let err = store.update_structure(&stale).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentUpdateConflict(_)));
    }

    #[tokio::test]
    async fn test_index_entries() {
        let store = setup_test_db().await;
        let a = person("Alpha");
        let b = person("Beta");
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();

        let candidate = SimilarityCandidate {
            item_id: b.id.clone(),
            score: 0.5,
            explanation: "weak name match".to_string(),
        };
        let entry = SimilarityIndexEntry::new(&a.id, EntityType::Person, vec![candidate], Utc::now());
        store.save_index_entry(&entry).await.unwrap();
        store
            .save_index_entry(&SimilarityIndexEntry::new(&b.id, EntityType::Person, vec![], Utc::now()))
            .await
            .unwrap();

        let loaded = store.get_index_entry(&a.id).await.unwrap().unwrap();
        assert_eq!(loaded.candidates.len(), 1);
        assert!(!loaded.stale);

        assert!(store.mark_index_stale(&a.id).await.unwrap());
        assert!(!store.mark_index_stale("missing").await.unwrap());
        assert!(store.get_index_entry(&a.id).await.unwrap().unwrap().stale);

        // saving again replaces the entry and clears the flag
        store.save_index_entry(&entry).await.unwrap();
        assert!(!store.get_index_entry(&a.id).await.unwrap().unwrap().stale);

        let removed = store
            .delete_index_entries_except(&EntityType::Person, &[a.id.clone()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_index_entry(&b.id).await.unwrap().is_none());

        let removed = store
            .delete_index_entries_except(&EntityType::Person, &[])
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_mentions_oldest_first() {
        let store = setup_test_db().await;
        let node = person("Jane Doe");
        store.insert_node(&node).await.unwrap();
        let now = Utc::now();

        for (offset, (name, decision)) in [
            ("Jane Doe", MergeDecision::Created),
            ("J. Doe", MergeDecision::LowConfidenceMerge),
        ]
        .into_iter()
        .enumerate()
        {
            store
                .record_mention(&MentionRecord {
                    node_id: node.id.clone(),
                    context_id: format!("ctx-{}", offset),
                    raw_name: name.to_string(),
                    decision,
                    score: 0.6,
                    observed_at: now + Duration::seconds(offset as i64),
                })
                .await
                .unwrap();
        }

        let mentions = store.mentions_for_node(&node.id).await.unwrap();
        assert_eq!(mentions.len(), 2);
        assert_eq!(mentions[0].decision, MergeDecision::Created);
        assert_eq!(mentions[1].raw_name, "J. Doe");
    }

    #[tokio::test]
    async fn test_stats() {
        let store = setup_test_db().await;
        let mut jane = person("Jane Doe");
        jane.mention_count = 5;
        let john = person("John Smith");
        let mut old = person("Old Timer");
        old.archive(Utc::now());
        for node in [&jane, &john, &old] {
            store.insert_node(node).await.unwrap();
        }
        let edge = RelationshipEdge::new(&jane.id, Predicate::WorksOn, &john.id, 0.8, "c", Utc::now());
        store.insert_edge(&edge).await.unwrap();
        store
            .save_index_entry(&SimilarityIndexEntry::new(&jane.id, EntityType::Person, vec![], Utc::now()))
            .await
            .unwrap();
        store.mark_index_stale(&jane.id).await.unwrap();

        let stats = store.stats(1).await.unwrap();
        assert_eq!(stats.active_nodes(), 2);
        assert_eq!(stats.nodes_by_type.get("PERSON"), Some(&2));
        assert_eq!(stats.active_edges(), 1);
        assert_eq!(stats.archived_nodes, 1);
        assert_eq!(stats.archived_edges, 0);
        assert_eq!(stats.index_entries, 1);
        assert_eq!(stats.stale_index_entries, 1);
        assert_eq!(stats.top_mentioned.len(), 1);
        assert_eq!(stats.top_mentioned[0].canonical_name, "Jane Doe");
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = early + Duration::microseconds(1);
        assert!(ts(early) < ts(later));
        assert_eq!(ts(early).len(), ts(later).len());
        assert_eq!(parse_ts(&ts(later)).unwrap(), later);
    }
}
