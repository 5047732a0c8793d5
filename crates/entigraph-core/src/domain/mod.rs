//! Domain layer
//!
//! Graph model, matching rules and the components that maintain the graph.

pub mod aggregator;
pub mod edge;
pub mod engine;
pub mod index;
pub mod index_builder;
pub mod locks;
pub mod node;
pub mod observation;
pub mod repository;
pub mod resolver;
pub mod similarity;
pub mod structure;
pub mod structure_learner;
pub mod tags;

pub use aggregator::{DecayReport, RelationshipAggregator};
pub use edge::{ContextWindow, RelationshipEdge, StrengthParams};
pub use engine::{
    ArchiveReport, EdgeView, KnowledgeGraphEngine, NodeExplanation, NodeView, SearchHit,
};
pub use index::{RebuildReport, SimilarityCandidate, SimilarityIndexEntry, SimilarityLookup};
pub use index_builder::SimilarityIndexBuilder;
pub use locks::TypeLocks;
pub use node::{CanonicalNode, MentionRecord, MergeDecision, Resolution};
pub use observation::{
    EntityObservation, IngestReport, ObservationBatch, RecordKind, RejectedRecord,
    RelationshipObservation, StructureMetadata, StructureObservation,
};
pub use repository::{GraphStats, GraphStore, TopEntity};
pub use resolver::EntityResolver;
pub use similarity::SimilarityScorer;
pub use structure::{StructureNode, StructureTree};
pub use structure_learner::StructureLearner;
pub use tags::{EntityType, Predicate};
