//! Canonical nodes: the deduplicated identity behind many noisy mentions
//!
//! A node's id never changes. Its display name may be promoted to a longer,
//! higher-confidence variant, and every variant ever merged in stays in the
//! alias set (folded), which always contains the folded canonical name.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::similarity::fold_name;
use super::tags::EntityType;

/// A deduplicated real-world entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalNode {
    /// Stable identifier, never reassigned
    pub id: String,
    /// Display name (best variant seen so far)
    pub canonical_name: String,
    pub entity_type: EntityType,
    /// Folded name variants, always including the folded canonical name
    pub aliases: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub mention_count: u64,
    /// Running average of mention confidence
    pub confidence: f64,
    /// Accumulated free-form metadata
    pub metadata: Map<String, Value>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version
    pub version: i64,
}

/// What a merged mention changed on a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MentionEffect {
    pub alias_added: bool,
    pub promoted: bool,
    pub metadata_changed: bool,
}

impl MentionEffect {
    /// Whether attributes used by the similarity index changed
    pub fn touches_index(&self) -> bool {
        self.alias_added || self.promoted || self.metadata_changed
    }
}

impl CanonicalNode {
    /// Create a node from its first, unmatched mention
    pub fn new(
        name: &str,
        entity_type: EntityType,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let display = display_name(name);
        let mut aliases = BTreeSet::new();
        aliases.insert(fold_name(&display));

        Self {
            id: Uuid::new_v4().to_string(),
            canonical_name: display,
            entity_type,
            aliases,
            first_seen: now,
            last_seen: now,
            mention_count: 1,
            confidence: confidence.clamp(0.0, 1.0),
            metadata: Map::new(),
            archived_at: None,
            version: 0,
        }
    }

    /// Folded canonical name
    pub fn folded_name(&self) -> String {
        fold_name(&self.canonical_name)
    }

    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }

    /// Exact match on canonical name or any alias (input already folded)
    pub fn matches_folded(&self, folded: &str) -> bool {
        self.aliases.contains(folded) || self.folded_name() == folded
    }

    /// Canonical name followed by every alias
    pub fn name_variants(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical_name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Days since the node was last mentioned
    pub fn days_since_seen(&self, now: DateTime<Utc>) -> f64 {
        let seconds = (now - self.last_seen).num_seconds().max(0) as f64;
        seconds / 86_400.0
    }

    /// Fold a matched mention into the node.
    ///
    /// The canonical name is promoted only when `allow_promotion` is set, the
    /// mention is more confident than the node's average so far, and the new
    /// name is strictly longer than the current one.
    pub fn record_mention(
        &mut self,
        name: &str,
        confidence: f64,
        now: DateTime<Utc>,
        allow_promotion: bool,
    ) -> MentionEffect {
        let display = display_name(name);
        let previous_average = self.confidence;
        let mut effect = MentionEffect {
            alias_added: self.aliases.insert(fold_name(&display)),
            ..Default::default()
        };

        let count = self.mention_count as f64;
        self.confidence = ((previous_average * count + confidence) / (count + 1.0)).clamp(0.0, 1.0);
        self.mention_count += 1;
        if now > self.last_seen {
            self.last_seen = now;
        }

        if allow_promotion
            && confidence > previous_average
            && display.chars().count() > self.canonical_name.chars().count()
        {
            self.canonical_name = display;
            effect.promoted = true;
        }

        effect
    }

    /// Merge metadata additively; returns whether anything changed
    pub fn merge_metadata(&mut self, incoming: &Map<String, Value>) -> bool {
        merge_metadata(&mut self.metadata, incoming)
    }

    pub fn archive(&mut self, now: DateTime<Utc>) {
        if self.archived_at.is_none() {
            self.archived_at = Some(now);
        }
    }
}

/// Trimmed name with internal whitespace collapsed, original casing kept
pub fn display_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// New keys are added, arrays are unioned in order, other values are replaced
pub fn merge_metadata(target: &mut Map<String, Value>, incoming: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        match (target.get_mut(key), value) {
            (Some(Value::Array(existing)), Value::Array(new_items)) => {
                for item in new_items {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                        changed = true;
                    }
                }
            }
            (Some(existing), _) if existing == value => {}
            _ => {
                target.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }
    changed
}

/// How a mention was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    /// No candidate cleared the merge threshold; a new node was created
    Created,
    /// Folded name equals the canonical name or an alias
    ExactMatch,
    /// Fuzzy match above the confident threshold
    Merged,
    /// Fuzzy match in the ambiguous band; merged but flagged for audit
    LowConfidenceMerge,
}

impl MergeDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ExactMatch => "exact_match",
            Self::Merged => "merged",
            Self::LowConfidenceMerge => "low_confidence_merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "exact_match" => Some(Self::ExactMatch),
            "merged" => Some(Self::Merged),
            "low_confidence_merge" => Some(Self::LowConfidenceMerge),
            _ => None,
        }
    }
}

impl std::fmt::Display for MergeDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the "explain this merge" audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionRecord {
    pub node_id: String,
    pub context_id: String,
    /// The name exactly as the extraction layer supplied it
    pub raw_name: String,
    pub decision: MergeDecision,
    /// Ranked total that drove the decision (1.0 for exact matches)
    pub score: f64,
    pub observed_at: DateTime<Utc>,
}

impl MentionRecord {
    /// Low-confidence merges are kept for human review
    pub fn is_flagged(&self) -> bool {
        self.decision == MergeDecision::LowConfidenceMerge
    }
}

/// Result of resolving one mention
#[derive(Debug, Clone)]
pub struct Resolution {
    pub node: CanonicalNode,
    pub decision: MergeDecision,
    pub score: f64,
}
