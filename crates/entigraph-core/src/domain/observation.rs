//! Observation records consumed from the extraction layer
//!
//! Tags arrive as raw strings so a malformed one rejects only its own record
//! (with the raw record kept for the log) instead of failing the whole batch
//! at deserialization time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::tags::{EntityType, Predicate};
use crate::error::{Error, Result};

/// Reject blank names
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be blank", what)));
    }
    Ok(())
}

/// Reject NaN and values outside [0, 1]
pub fn validate_confidence(confidence: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(Error::InvalidInput(format!(
            "confidence must be between 0.0 and 1.0 (got {})",
            confidence
        )));
    }
    Ok(())
}

pub fn validate_context_id(context_id: &str) -> Result<()> {
    if context_id.trim().is_empty() {
        return Err(Error::InvalidInput(
            "source context id must not be blank".to_string(),
        ));
    }
    Ok(())
}

/// Hierarchy metadata attached to an entity observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureMetadata {
    pub structure_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
}

/// One detected entity: `{name, entity_type, confidence, source_context_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityObservation {
    pub name: String,
    pub entity_type: String,
    pub confidence: f64,
    #[serde(alias = "context_id")]
    pub source_context_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<StructureMetadata>,
}

impl EntityObservation {
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        confidence: f64,
        source_context_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            confidence,
            source_context_id: source_context_id.into(),
            metadata: Map::new(),
            structure: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_structure(mut self, structure: StructureMetadata) -> Self {
        self.structure = Some(structure);
        self
    }

    /// Validate every field and parse the type tag
    pub fn validate(&self) -> Result<EntityType> {
        validate_name("entity name", &self.name)?;
        validate_confidence(self.confidence)?;
        validate_context_id(&self.source_context_id)?;
        EntityType::parse_flagged(&self.entity_type)
    }
}

/// One detected relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipObservation {
    pub subject: String,
    pub subject_type: String,
    pub predicate: String,
    pub object: String,
    pub object_type: String,
    pub confidence: f64,
    #[serde(alias = "context_id")]
    pub source_context_id: String,
}

/// A relationship observation with its tags parsed
#[derive(Debug, Clone)]
pub struct ValidRelationship {
    pub subject_type: EntityType,
    pub predicate: Predicate,
    pub object_type: EntityType,
}

impl RelationshipObservation {
    pub fn new(
        subject: impl Into<String>,
        subject_type: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        object_type: impl Into<String>,
        confidence: f64,
        source_context_id: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            subject_type: subject_type.into(),
            predicate: predicate.into(),
            object: object.into(),
            object_type: object_type.into(),
            confidence,
            source_context_id: source_context_id.into(),
        }
    }

    pub fn validate(&self) -> Result<ValidRelationship> {
        validate_name("subject name", &self.subject)?;
        validate_name("object name", &self.object)?;
        validate_confidence(self.confidence)?;
        validate_context_id(&self.source_context_id)?;
        Ok(ValidRelationship {
            subject_type: EntityType::parse_flagged(&self.subject_type)?,
            predicate: Predicate::parse_flagged(&self.predicate)?,
            object_type: EntityType::parse_flagged(&self.object_type)?,
        })
    }
}

/// Input to the structure learner: one hierarchy level at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureObservation {
    pub structure_type: String,
    pub name: String,
    #[serde(default)]
    pub parent_type: Option<String>,
    #[serde(default)]
    pub parent_name: Option<String>,
    pub context_id: String,
    #[serde(default)]
    pub associated_node_id: Option<String>,
}

impl StructureObservation {
    pub fn new(
        structure_type: impl Into<String>,
        name: impl Into<String>,
        context_id: impl Into<String>,
    ) -> Self {
        Self {
            structure_type: structure_type.into(),
            name: name.into(),
            parent_type: None,
            parent_name: None,
            context_id: context_id.into(),
            associated_node_id: None,
        }
    }

    pub fn with_parent(mut self, parent_type: impl Into<String>, parent_name: impl Into<String>) -> Self {
        self.parent_type = Some(parent_type.into());
        self.parent_name = Some(parent_name.into());
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.associated_node_id = Some(node_id.into());
        self
    }

    /// Build from metadata attached to an entity observation
    pub fn from_metadata(
        metadata: &StructureMetadata,
        context_id: &str,
        associated_node_id: Option<String>,
    ) -> Self {
        Self {
            structure_type: metadata.structure_type.clone(),
            name: metadata.name.clone(),
            parent_type: metadata.parent_type.clone(),
            parent_name: metadata.parent_name.clone(),
            context_id: context_id.to_string(),
            associated_node_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("structure type", &self.structure_type)?;
        validate_name("structure name", &self.name)?;
        validate_context_id(&self.context_id)?;
        match (&self.parent_type, &self.parent_name) {
            (None, None) => Ok(()),
            (Some(parent_type), Some(parent_name)) => {
                validate_name("parent structure type", parent_type)?;
                validate_name("parent structure name", parent_name)
            }
            _ => Err(Error::InvalidInput(
                "parent_type and parent_name must be given together".to_string(),
            )),
        }
    }
}

/// Everything extracted from one or more contexts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationBatch {
    #[serde(default)]
    pub entities: Vec<EntityObservation>,
    #[serde(default)]
    pub relationships: Vec<RelationshipObservation>,
}

impl ObservationBatch {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// Which kind of record was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Entity,
    Relationship,
    Structure,
}

/// A record that failed, with the raw input for tracing back upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub kind: RecordKind,
    pub record: Value,
    pub code: String,
    pub error: String,
}

/// Summary of one batch ingest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub entities_resolved: usize,
    pub nodes_created: usize,
    pub low_confidence_merges: usize,
    pub relationships_observed: usize,
    pub structures_observed: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl IngestReport {
    pub fn merge(&mut self, other: IngestReport) {
        self.entities_resolved += other.entities_resolved;
        self.nodes_created += other.nodes_created;
        self.low_confidence_merges += other.low_confidence_merges;
        self.relationships_observed += other.relationships_observed;
        self.structures_observed += other.structures_observed;
        self.rejected.extend(other.rejected);
    }
}
