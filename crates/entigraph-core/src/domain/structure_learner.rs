//! Hierarchy discovery
//!
//! Structure nodes are keyed by (type, folded name, parent) and merge only on
//! an exact folded name. Callers feed one parent level per observation; deeper
//! hierarchies emerge from repeated calls as each level is seen.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::error::{Error, Result};

use super::observation::StructureObservation;
use super::repository::GraphStore;
use super::similarity::fold_name;
use super::structure::{StructureNode, StructureTree};

/// Most-mentioned first, then smallest id
fn prefer(nodes: Vec<StructureNode>) -> Option<StructureNode> {
    nodes.into_iter().min_by(|a, b| {
        b.mention_count
            .cmp(&a.mention_count)
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Records structure observations and builds the forest
pub struct StructureLearner<S: GraphStore> {
    store: Arc<S>,
    context_window: usize,
    max_retries: u32,
}

impl<S: GraphStore> StructureLearner<S> {
    /// Shares the context window and retry budget of the aggregator
    pub fn new(store: Arc<S>, config: &AggregatorConfig) -> Self {
        Self {
            store,
            context_window: config.context_window,
            max_retries: config.max_retries,
        }
    }

    pub async fn observe_structure(&self, observation: &StructureObservation) -> Result<StructureNode> {
        self.observe_structure_at(observation, Utc::now()).await
    }

    pub async fn observe_structure_at(
        &self,
        observation: &StructureObservation,
        now: DateTime<Utc>,
    ) -> Result<StructureNode> {
        observation.validate()?;

        let mut attempt = 0;
        loop {
            match self.try_observe(observation, now).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(name = %observation.name, attempt, "Retrying structure observation after conflict");
                }
                other => return other,
            }
        }
    }

    async fn try_observe(
        &self,
        observation: &StructureObservation,
        now: DateTime<Utc>,
    ) -> Result<StructureNode> {
        let structure_type = fold_name(&observation.structure_type);
        let name_key = fold_name(&observation.name);

        let parent = match (&observation.parent_type, &observation.parent_name) {
            (Some(parent_type), Some(parent_name)) => {
                Some(self.find_or_create_parent(parent_type, parent_name, now).await?)
            }
            _ => None,
        };

        let mut node = match &parent {
            Some(parent) => {
                self.keyed_under_parent(&structure_type, &name_key, observation, parent, now)
                    .await?
            }
            None => match self.store.find_structure(&structure_type, &name_key, "").await? {
                Some(root) => root,
                None => match prefer(self.store.find_structures_by_name(&structure_type, &name_key).await?) {
                    Some(existing) => existing,
                    None => self.insert(StructureNode::new(&structure_type, &observation.name, None, now)).await?,
                },
            },
        };

        node.record_observation(
            &observation.context_id,
            observation.associated_node_id.as_deref(),
            self.context_window,
            now,
        );
        self.store.update_structure(&node).await?;
        node.version += 1;

        debug!(
            structure_id = %node.id,
            name = %node.name,
            mention_count = node.mention_count,
            context_count = node.context_count,
            "Recorded structure observation"
        );
        Ok(node)
    }

    /// Resolve the node under `parent`, adopting an unparented root when safe
    async fn keyed_under_parent(
        &self,
        structure_type: &str,
        name_key: &str,
        observation: &StructureObservation,
        parent: &StructureNode,
        now: DateTime<Utc>,
    ) -> Result<StructureNode> {
        if let Some(existing) = self
            .store
            .find_structure(structure_type, name_key, &parent.id)
            .await?
        {
            return Ok(existing);
        }

        if let Some(mut root) = self.store.find_structure(structure_type, name_key, "").await? {
            if !self.would_cycle(&root.id, &parent.id).await? {
                root.parent_id = Some(parent.id.clone());
                info!(structure_id = %root.id, name = %root.name, parent = %parent.name, "Structure adopted parent");
                return Ok(root);
            }
            warn!(
                structure_id = %root.id,
                parent_id = %parent.id,
                "Parent would create a cycle; keeping a separate node"
            );
        }

        let others = self.store.find_structures_by_name(structure_type, name_key).await?;
        if let Some(other) = others.iter().find(|n| n.parent_id.is_some()) {
            warn!(
                structure_id = %other.id,
                name = %other.name,
                existing_parent = %other.parent_key(),
                new_parent = %parent.id,
                "Structure parent conflict; keying a separate node under the new parent"
            );
        }

        self.insert(StructureNode::new(
            structure_type,
            &observation.name,
            Some(parent.id.clone()),
            now,
        ))
        .await
    }

    async fn find_or_create_parent(
        &self,
        parent_type: &str,
        parent_name: &str,
        now: DateTime<Utc>,
    ) -> Result<StructureNode> {
        let parent_type = fold_name(parent_type);
        let key = fold_name(parent_name);
        // An archived root still owns its key; reuse it rather than collide
        if let Some(root) = self.store.find_structure(&parent_type, &key, "").await? {
            return Ok(root);
        }
        match prefer(self.store.find_structures_by_name(&parent_type, &key).await?) {
            Some(parent) => Ok(parent),
            None => {
                let parent = StructureNode::new(&parent_type, parent_name, None, now);
                info!(structure_id = %parent.id, name = %parent.name, structure_type = %parent_type, "Created parent structure");
                self.insert(parent).await
            }
        }
    }

    async fn insert(&self, node: StructureNode) -> Result<StructureNode> {
        self.store.insert_structure(&node).await?;
        info!(structure_id = %node.id, name = %node.name, structure_type = %node.structure_type, "Created structure node");
        Ok(node)
    }

    /// Whether `node_id` is `parent_id` or one of its ancestors
    async fn would_cycle(&self, node_id: &str, parent_id: &str) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut current = Some(parent_id.to_string());
        while let Some(id) = current {
            if id == node_id {
                return Ok(true);
            }
            if !seen.insert(id.clone()) {
                return Ok(true);
            }
            current = self
                .store
                .get_structure(&id)
                .await?
                .and_then(|node| node.parent_id);
        }
        Ok(false)
    }

    /// Explicit archival; archived structures drop out of the forest
    pub async fn archive_structure(&self, id: &str, now: DateTime<Utc>) -> Result<StructureNode> {
        let mut node = self
            .store
            .get_structure(id)
            .await?
            .ok_or_else(|| Error::StructureNotFound(id.to_string()))?;

        if node.archived_at.is_none() {
            node.archived_at = Some(now);
            node.updated_at = now;
            self.store.update_structure(&node).await?;
            node.version += 1;
            info!(structure_id = %node.id, name = %node.name, "Archived structure node");
        }
        Ok(node)
    }

    /// The active structure forest, optionally rooted at every node of one type
    pub async fn hierarchy(&self, structure_type: Option<&str>) -> Result<Vec<StructureTree>> {
        let nodes = self.store.list_structures(None).await?;
        let active: HashSet<String> = nodes.iter().map(|n| n.id.clone()).collect();

        let mut children: HashMap<String, Vec<StructureNode>> = HashMap::new();
        let mut roots = Vec::new();
        let wanted = structure_type.map(fold_name);

        for node in nodes {
            let is_root = match &wanted {
                Some(t) => &node.structure_type == t,
                None => node
                    .parent_id
                    .as_ref()
                    .is_none_or(|parent| !active.contains(parent)),
            };
            if is_root {
                roots.push(node.clone());
            }
            if let Some(parent) = &node.parent_id {
                children.entry(parent.clone()).or_default().push(node);
            }
        }

        roots.sort_by(|a, b| a.name_key.cmp(&b.name_key));
        let forest = roots
            .into_iter()
            .map(|root| {
                let mut visited = HashSet::new();
                build_tree(root, &children, &mut visited)
            })
            .collect();
        Ok(forest)
    }
}

fn build_tree(
    node: StructureNode,
    children: &HashMap<String, Vec<StructureNode>>,
    visited: &mut HashSet<String>,
) -> StructureTree {
    visited.insert(node.id.clone());
    let mut kids: Vec<StructureNode> = children
        .get(&node.id)
        .map(|list| {
            list.iter()
                .filter(|child| !visited.contains(&child.id))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    kids.sort_by(|a, b| a.name_key.cmp(&b.name_key));

    let subtrees = kids
        .into_iter()
        .map(|child| build_tree(child, children, visited))
        .collect();
    StructureTree {
        node,
        children: subtrees,
    }
}
