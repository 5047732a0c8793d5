//! Error types for Entigraph

use thiserror::Error;

/// Result type alias using Entigraph's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Entigraph error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Input errors (E001-E099)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Lookup errors (E100-E199)
    #[error("Canonical node '{0}' not found. Run `entigraph search <name>` to find node ids.")]
    NodeNotFound(String),

    #[error("Structure node '{0}' not found. Run `entigraph hierarchy` to list structures.")]
    StructureNotFound(String),

    // Concurrency errors (E200-E299)
    #[error("Concurrent update conflict on {0}. Another writer changed it first.")]
    ConcurrentUpdateConflict(String),

    // Index errors (E300-E399)
    #[error("Similarity index rebuild interrupted after {rebuilt} of {total} items. Stale entries remain usable.")]
    IndexBuildInterrupted { rebuilt: usize, total: usize },

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "E001",
            Self::NodeNotFound(_) => "E100",
            Self::StructureNotFound(_) => "E102",
            Self::ConcurrentUpdateConflict(_) => "E200",
            Self::IndexBuildInterrupted { .. } => "E300",
            Self::DatabaseError(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::ConfigError(_) => "E600",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NodeNotFound(_) => Some("entigraph search <name>".to_string()),
            Self::StructureNotFound(_) => Some("entigraph hierarchy".to_string()),
            Self::IndexBuildInterrupted { .. } => {
                Some("entigraph maintain rebuild-index --kind <KIND>".to_string())
            }
            Self::ConfigError(_) => Some("entigraph config list".to_string()),
            _ => None,
        }
    }

    /// Whether the failed operation may succeed if retried against fresh state
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentUpdateConflict(_))
    }

    /// Map a sqlx error raised by an insert, turning unique-key races into conflicts
    pub(crate) fn from_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConcurrentUpdateConflict(what.into())
            }
            _ => Self::DatabaseError(err),
        }
    }
}
