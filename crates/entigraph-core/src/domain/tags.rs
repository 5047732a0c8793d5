//! Open-ended tags for entity types and relationship predicates
//!
//! Both tag kinds have a known core set plus a `Custom` escape hatch, so a
//! relationship type first seen in the wild does not need a code change.
//! Tags are normalized to UPPER_SNAKE before comparison or storage.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Normalize a raw tag to UPPER_SNAKE, rejecting malformed input
fn normalize_tag(kind: &str, raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput(format!("{} tag must not be blank", kind)));
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|c| !(c.is_alphanumeric() || *c == '_' || *c == '-' || *c == ' '))
    {
        return Err(Error::InvalidInput(format!(
            "{} tag '{}' contains invalid character '{}'",
            kind, raw, bad
        )));
    }

    Ok(trimmed
        .split(|c: char| c == ' ' || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_uppercase())
        .collect::<Vec<_>>()
        .join("_"))
}

/// Type of a canonical node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntityType {
    Person,
    Project,
    Team,
    Date,
    Concept,
    Task,
    Organization,
    Location,
    /// A well-formed type outside the core set
    Custom(String),
}

impl EntityType {
    /// Get the string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::Person => "PERSON",
            Self::Project => "PROJECT",
            Self::Team => "TEAM",
            Self::Date => "DATE",
            Self::Concept => "CONCEPT",
            Self::Task => "TASK",
            Self::Organization => "ORGANIZATION",
            Self::Location => "LOCATION",
            Self::Custom(tag) => tag,
        }
    }

    /// Parse from string. Unknown but well-formed tags become `Custom`.
    pub fn parse(s: &str) -> Result<Self> {
        let tag = normalize_tag("Entity type", s)?;
        Ok(match tag.as_str() {
            "PERSON" | "PEOPLE" => Self::Person,
            "PROJECT" => Self::Project,
            "TEAM" => Self::Team,
            "DATE" => Self::Date,
            "CONCEPT" => Self::Concept,
            "TASK" => Self::Task,
            "ORGANIZATION" | "ORG" => Self::Organization,
            "LOCATION" | "PLACE" => Self::Location,
            _ => Self::Custom(tag),
        })
    }

    /// Parse and log when the tag falls outside the core set
    pub fn parse_flagged(s: &str) -> Result<Self> {
        let parsed = Self::parse(s)?;
        if parsed.is_custom() {
            warn!(entity_type = %parsed, raw = %s, "Unknown entity type accepted");
        }
        Ok(parsed)
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }

    /// Get all core entity types
    pub fn core() -> &'static [EntityType] {
        &[
            Self::Person,
            Self::Project,
            Self::Team,
            Self::Date,
            Self::Concept,
            Self::Task,
            Self::Organization,
            Self::Location,
        ]
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for EntityType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

/// Predicate of a relationship edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Predicate {
    WorksOn,
    CommunicatesWith,
    HasDeadline,
    MemberOf,
    ReportsTo,
    Owns,
    Mentions,
    DependsOn,
    RelatedTo,
    /// A well-formed predicate outside the core set
    Custom(String),
}

impl Predicate {
    /// Get the string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorksOn => "WORKS_ON",
            Self::CommunicatesWith => "COMMUNICATES_WITH",
            Self::HasDeadline => "HAS_DEADLINE",
            Self::MemberOf => "MEMBER_OF",
            Self::ReportsTo => "REPORTS_TO",
            Self::Owns => "OWNS",
            Self::Mentions => "MENTIONS",
            Self::DependsOn => "DEPENDS_ON",
            Self::RelatedTo => "RELATED_TO",
            Self::Custom(tag) => tag,
        }
    }

    /// Parse from string. Unknown but well-formed tags become `Custom`.
    pub fn parse(s: &str) -> Result<Self> {
        let tag = normalize_tag("Predicate", s)?;
        Ok(match tag.as_str() {
            "WORKS_ON" => Self::WorksOn,
            "COMMUNICATES_WITH" => Self::CommunicatesWith,
            "HAS_DEADLINE" => Self::HasDeadline,
            "MEMBER_OF" => Self::MemberOf,
            "REPORTS_TO" => Self::ReportsTo,
            "OWNS" => Self::Owns,
            "MENTIONS" => Self::Mentions,
            "DEPENDS_ON" => Self::DependsOn,
            "RELATED_TO" => Self::RelatedTo,
            _ => Self::Custom(tag),
        })
    }

    /// Parse and log when the tag falls outside the core set
    pub fn parse_flagged(s: &str) -> Result<Self> {
        let parsed = Self::parse(s)?;
        if parsed.is_custom() {
            warn!(predicate = %parsed, raw = %s, "Unknown predicate accepted");
        }
        Ok(parsed)
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<Predicate> for String {
    fn from(value: Predicate) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for Predicate {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}
