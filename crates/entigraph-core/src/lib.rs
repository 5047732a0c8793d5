//! Entigraph Core Library
//!
//! A self-deduplicating knowledge graph for people, projects, teams and the
//! links between them. This crate provides:
//! - Entity resolution (fuzzy matching of raw mentions onto canonical nodes)
//! - Relationship aggregation with strength scoring and time decay
//! - Organizational structure discovery
//! - A precomputed similarity index with explanations
//! - SQLite persistence and migrations

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod storage;


pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::domain::{
        CanonicalNode, EntityObservation, EntityType, GraphStore, KnowledgeGraphEngine,
        ObservationBatch, Predicate, RelationshipEdge, RelationshipObservation,
        StructureObservation,
    };
    pub use crate::error::{Error, Result};
    pub use crate::infrastructure::SqliteGraphStore;
    pub use crate::storage::{Database, DatabaseConfig};
}
