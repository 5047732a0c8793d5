//! Self-discovered hierarchy nodes (pillar / team / role ...)

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::edge::ContextWindow;
use super::node::display_name;
use super::similarity::fold_name;

/// A node in a schema-free hierarchy forest.
///
/// Unique by (structure_type, folded name, parent id). Names only merge on an
/// exact folded match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureNode {
    pub id: String,
    /// Folded type tag, e.g. "team"
    pub structure_type: String,
    pub name: String,
    /// Folded name, the merge key
    pub name_key: String,
    pub parent_id: Option<String>,
    pub mention_count: u64,
    pub context_count: u64,
    pub recent_contexts: ContextWindow,
    pub associated_node_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl StructureNode {
    pub fn new(
        structure_type: &str,
        name: &str,
        parent_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let name = display_name(name);
        Self {
            id: Uuid::new_v4().to_string(),
            structure_type: fold_name(structure_type),
            name_key: fold_name(&name),
            name,
            parent_id,
            mention_count: 0,
            context_count: 0,
            recent_contexts: ContextWindow::new(),
            associated_node_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            archived_at: None,
            version: 0,
        }
    }

    /// Parent id as stored in the unique key ("" for roots)
    pub fn parent_key(&self) -> &str {
        self.parent_id.as_deref().unwrap_or("")
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }

    /// Count one observation; context_count only grows for unseen contexts
    pub fn record_observation(
        &mut self,
        context_id: &str,
        associated_node_id: Option<&str>,
        context_window: usize,
        now: DateTime<Utc>,
    ) {
        self.mention_count += 1;
        if self.recent_contexts.observe(context_id, context_window) {
            self.context_count += 1;
        }
        if let Some(node_id) = associated_node_id {
            self.associated_node_ids.insert(node_id.to_string());
        }
        self.updated_at = now;
    }
}

/// One subtree of the structure forest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureTree {
    pub node: StructureNode,
    pub children: Vec<StructureTree>,
}

impl StructureTree {
    /// Number of nodes in this subtree, root included
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(StructureTree::size).sum::<usize>()
    }

    /// Depth-first search by folded name
    pub fn find(&self, name: &str) -> Option<&StructureTree> {
        let key = fold_name(name);
        if self.node.name_key == key {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_structure_node_keys() {
        let node = StructureNode::new(" Team ", "  Menu   Team", None, Utc::now());
        assert_eq!(node.structure_type, "team");
        assert_eq!(node.name, "Menu Team");
        assert_eq!(node.name_key, "menu team");
        assert_eq!(node.parent_key(), "");
        assert!(node.is_root());
        assert_eq!(node.mention_count, 0);
    }

    #[test]
    fn test_record_observation_dedups_contexts() {
        let mut node = StructureNode::new("team", "Menu Team", Some("p".into()), Utc::now());
        node.record_observation("c1", Some("n1"), 32, Utc::now());
        node.record_observation("c1", Some("n2"), 32, Utc::now());
        node.record_observation("c2", None, 32, Utc::now());

        assert_eq!(node.mention_count, 3);
        assert_eq!(node.context_count, 2);
        assert_eq!(node.associated_node_ids.len(), 2);
        assert_eq!(node.parent_key(), "p");
    }

    #[test]
    fn test_tree_size_and_find() {
        let now = Utc::now();
        let tree = StructureTree {
            node: StructureNode::new("pillar", "Customer Pillar", None, now),
            children: vec![StructureTree {
                node: StructureNode::new("team", "Menu Team", Some("x".into()), now),
                children: vec![],
            }],
        };
        assert_eq!(tree.size(), 2);
        assert!(tree.find("menu team").is_some());
        assert!(tree.find("search team").is_none());
    }
}
