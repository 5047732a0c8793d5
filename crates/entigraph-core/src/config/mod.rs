//! Engine configuration with file persistence
//!
//! Every merge/no-merge threshold, decay constant and index weight lives here
//! so it can be tuned offline against labelled data without code changes.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Longest accepted decay or retention window, roughly a century
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// Entigraph configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub resolver: ResolverConfig,
    pub aggregator: AggregatorConfig,
    pub retention: RetentionConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub storage: StorageConfig,
}

/// Entity resolution thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum similarity for a node to be considered a candidate at all
    pub candidate_floor: f64,
    /// Ranked total at which a mention merges (low-confidence band starts here)
    pub merge_threshold: f64,
    /// Ranked total at which a merge is fully confident
    pub confident_merge_threshold: f64,
    pub mention_boost_cap: f64,
    pub mention_boost_divisor: f64,
    pub recency_boost_max: f64,
    pub recency_boost_decay_days: f64,
    /// Added to the edit ratio when one name abbreviates the other
    pub abbreviation_bonus: f64,
    pub max_retries: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            candidate_floor: 0.5,
            merge_threshold: 0.60,
            confident_merge_threshold: 0.75,
            mention_boost_cap: 0.1,
            mention_boost_divisor: 100.0,
            recency_boost_max: 0.1,
            recency_boost_decay_days: 100.0,
            abbreviation_bonus: 0.3,
            max_retries: 3,
        }
    }
}

/// Relationship aggregation and decay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Mention count beyond which strength stops growing
    pub mention_cap: u32,
    /// Distinct context count beyond which strength stops growing
    pub context_cap: u32,
    /// How many recent context ids each edge remembers for dedup
    pub context_window: usize,
    pub decay_window_days: i64,
    /// Fraction of strength removed per decay pass
    pub decay_factor: f64,
    pub prune_floor: f64,
    pub max_retries: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            mention_cap: 10,
            context_cap: 5,
            context_window: 32,
            decay_window_days: 30,
            decay_factor: 0.10,
            prune_floor: 0.3,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub node_retention_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            node_retention_days: 180,
        }
    }
}

/// Similarity index weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub top_k: usize,
    pub min_score: f64,
    pub title_weight: f64,
    pub tag_weight: f64,
    pub neighborhood_weight: f64,
    /// Metadata keys whose string values count as tags
    pub tag_keys: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.15,
            title_weight: 0.5,
            tag_weight: 0.2,
            neighborhood_weight: 0.3,
            tag_keys: vec!["tags".to_string(), "category".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub min_score: f64,
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_score: 0.3,
            default_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_connections: 5,
        }
    }
}

const KEYS: &[&str] = &[
    "resolver.candidate_floor",
    "resolver.merge_threshold",
    "resolver.confident_merge_threshold",
    "resolver.mention_boost_cap",
    "resolver.mention_boost_divisor",
    "resolver.recency_boost_max",
    "resolver.recency_boost_decay_days",
    "resolver.abbreviation_bonus",
    "resolver.max_retries",
    "aggregator.mention_cap",
    "aggregator.context_cap",
    "aggregator.context_window",
    "aggregator.decay_window_days",
    "aggregator.decay_factor",
    "aggregator.prune_floor",
    "aggregator.max_retries",
    "retention.node_retention_days",
    "index.top_k",
    "index.min_score",
    "index.title_weight",
    "index.tag_weight",
    "index.neighborhood_weight",
    "index.tag_keys",
    "search.min_score",
    "search.default_limit",
    "storage.database_path",
    "storage.max_connections",
];

impl EngineConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("ENTIGRAPH_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("entigraph")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: EngineConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(EngineConfig::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let r = &self.resolver;
        for (key, value) in [
            ("resolver.candidate_floor", r.candidate_floor),
            ("resolver.merge_threshold", r.merge_threshold),
            ("resolver.confident_merge_threshold", r.confident_merge_threshold),
            ("resolver.mention_boost_cap", r.mention_boost_cap),
            ("resolver.recency_boost_max", r.recency_boost_max),
            ("resolver.abbreviation_bonus", r.abbreviation_bonus),
            ("aggregator.decay_factor", self.aggregator.decay_factor),
            ("aggregator.prune_floor", self.aggregator.prune_floor),
            ("index.min_score", self.index.min_score),
            ("search.min_score", self.search.min_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0.0 and 1.0 (got {})", key, value));
            }
        }

        if r.merge_threshold > r.confident_merge_threshold {
            return Err(anyhow!(
                "resolver.merge_threshold ({}) must not exceed resolver.confident_merge_threshold ({})",
                r.merge_threshold,
                r.confident_merge_threshold
            ));
        }
        if r.mention_boost_divisor <= 0.0 || r.recency_boost_decay_days <= 0.0 {
            return Err(anyhow!("Resolver boost divisors must be positive"));
        }

        let a = &self.aggregator;
        if a.mention_cap == 0 || a.context_cap == 0 || a.context_window == 0 {
            return Err(anyhow!("Aggregator caps and context window must be at least 1"));
        }
        for (key, days) in [
            ("aggregator.decay_window_days", a.decay_window_days),
            ("retention.node_retention_days", self.retention.node_retention_days),
        ] {
            if !(0..=MAX_WINDOW_DAYS).contains(&days) {
                return Err(anyhow!(
                    "{} must be between 0 and {} days (got {})",
                    key,
                    MAX_WINDOW_DAYS,
                    days
                ));
            }
        }

        let i = &self.index;
        if i.top_k == 0 {
            return Err(anyhow!("index.top_k must be at least 1"));
        }
        if [i.title_weight, i.tag_weight, i.neighborhood_weight]
            .iter()
            .any(|w| *w < 0.0)
        {
            return Err(anyhow!("Index weights must be non-negative"));
        }
        if i.title_weight + i.tag_weight + i.neighborhood_weight <= 0.0 {
            return Err(anyhow!("At least one index weight must be positive"));
        }

        if self.storage.max_connections == 0 {
            return Err(anyhow!("storage.max_connections must be at least 1"));
        }

        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "resolver.candidate_floor" => self.resolver.candidate_floor.to_string(),
            "resolver.merge_threshold" => self.resolver.merge_threshold.to_string(),
            "resolver.confident_merge_threshold" => {
                self.resolver.confident_merge_threshold.to_string()
            }
            "resolver.mention_boost_cap" => self.resolver.mention_boost_cap.to_string(),
            "resolver.mention_boost_divisor" => self.resolver.mention_boost_divisor.to_string(),
            "resolver.recency_boost_max" => self.resolver.recency_boost_max.to_string(),
            "resolver.recency_boost_decay_days" => {
                self.resolver.recency_boost_decay_days.to_string()
            }
            "resolver.abbreviation_bonus" => self.resolver.abbreviation_bonus.to_string(),
            "resolver.max_retries" => self.resolver.max_retries.to_string(),

            "aggregator.mention_cap" => self.aggregator.mention_cap.to_string(),
            "aggregator.context_cap" => self.aggregator.context_cap.to_string(),
            "aggregator.context_window" => self.aggregator.context_window.to_string(),
            "aggregator.decay_window_days" => self.aggregator.decay_window_days.to_string(),
            "aggregator.decay_factor" => self.aggregator.decay_factor.to_string(),
            "aggregator.prune_floor" => self.aggregator.prune_floor.to_string(),
            "aggregator.max_retries" => self.aggregator.max_retries.to_string(),

            "retention.node_retention_days" => self.retention.node_retention_days.to_string(),

            "index.top_k" => self.index.top_k.to_string(),
            "index.min_score" => self.index.min_score.to_string(),
            "index.title_weight" => self.index.title_weight.to_string(),
            "index.tag_weight" => self.index.tag_weight.to_string(),
            "index.neighborhood_weight" => self.index.neighborhood_weight.to_string(),
            "index.tag_keys" => self.index.tag_keys.join(", "),

            "search.min_score" => self.search.min_score.to_string(),
            "search.default_limit" => self.search.default_limit.to_string(),

            "storage.database_path" => match &self.storage.database_path {
                Some(path) => path.display().to_string(),
                None => "(default)".to_string(),
            },
            "storage.max_connections" => self.storage.max_connections.to_string(),

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `entigraph config list` to see available keys.",
                    key
                ));
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key; the result is validated as a whole
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut next = self.clone();
        match key {
            "resolver.candidate_floor" => next.resolver.candidate_floor = parse(key, value)?,
            "resolver.merge_threshold" => next.resolver.merge_threshold = parse(key, value)?,
            "resolver.confident_merge_threshold" => {
                next.resolver.confident_merge_threshold = parse(key, value)?
            }
            "resolver.mention_boost_cap" => next.resolver.mention_boost_cap = parse(key, value)?,
            "resolver.mention_boost_divisor" => {
                next.resolver.mention_boost_divisor = parse(key, value)?
            }
            "resolver.recency_boost_max" => next.resolver.recency_boost_max = parse(key, value)?,
            "resolver.recency_boost_decay_days" => {
                next.resolver.recency_boost_decay_days = parse(key, value)?
            }
            "resolver.abbreviation_bonus" => {
                next.resolver.abbreviation_bonus = parse(key, value)?
            }
            "resolver.max_retries" => next.resolver.max_retries = parse(key, value)?,

            "aggregator.mention_cap" => next.aggregator.mention_cap = parse(key, value)?,
            "aggregator.context_cap" => next.aggregator.context_cap = parse(key, value)?,
            "aggregator.context_window" => next.aggregator.context_window = parse(key, value)?,
            "aggregator.decay_window_days" => {
                next.aggregator.decay_window_days = parse(key, value)?
            }
            "aggregator.decay_factor" => next.aggregator.decay_factor = parse(key, value)?,
            "aggregator.prune_floor" => next.aggregator.prune_floor = parse(key, value)?,
            "aggregator.max_retries" => next.aggregator.max_retries = parse(key, value)?,

            "retention.node_retention_days" => {
                next.retention.node_retention_days = parse(key, value)?
            }

            "index.top_k" => next.index.top_k = parse(key, value)?,
            "index.min_score" => next.index.min_score = parse(key, value)?,
            "index.title_weight" => next.index.title_weight = parse(key, value)?,
            "index.tag_weight" => next.index.tag_weight = parse(key, value)?,
            "index.neighborhood_weight" => next.index.neighborhood_weight = parse(key, value)?,
            "index.tag_keys" => {
                next.index.tag_keys = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }

            "search.min_score" => next.search.min_score = parse(key, value)?,
            "search.default_limit" => next.search.default_limit = parse(key, value)?,

            "storage.database_path" => {
                next.storage.database_path = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "storage.max_connections" => next.storage.max_connections = parse(key, value)?,

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `entigraph config list` to see available keys.",
                    key
                ));
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid value for {}: {} ({})", key, value, e))
}
