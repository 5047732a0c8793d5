//! Database migrations
//!
//! Versioned SQLite schema for the graph. Migrations are applied in order on
//! connection and recorded in `_migrations`.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: nodes, edges and the mention audit trail
const MIGRATION_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS canonical_nodes (
        id TEXT PRIMARY KEY NOT NULL,
        canonical_name TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        aliases TEXT NOT NULL DEFAULT '[]',
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        mention_count INTEGER NOT NULL DEFAULT 0,
        confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
        metadata TEXT NOT NULL DEFAULT '{}',
        archived_at TEXT,
        version INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_type ON canonical_nodes(entity_type);
    CREATE INDEX IF NOT EXISTS idx_nodes_last_seen ON canonical_nodes(last_seen);
    CREATE INDEX IF NOT EXISTS idx_nodes_archived ON canonical_nodes(archived_at);

    CREATE TABLE IF NOT EXISTS relationship_edges (
        id TEXT PRIMARY KEY NOT NULL,
        subject_id TEXT NOT NULL REFERENCES canonical_nodes(id) ON DELETE CASCADE,
        predicate TEXT NOT NULL,
        object_id TEXT NOT NULL REFERENCES canonical_nodes(id) ON DELETE CASCADE,
        strength REAL NOT NULL DEFAULT 0.0,
        mention_count INTEGER NOT NULL DEFAULT 0,
        context_count INTEGER NOT NULL DEFAULT 0,
        confidence REAL NOT NULL DEFAULT 0.0,
        recent_contexts TEXT NOT NULL DEFAULT '[]',
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        archived_at TEXT,
        pending_delete INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 0,
        UNIQUE (subject_id, predicate, object_id)
    );

    CREATE INDEX IF NOT EXISTS idx_edges_subject ON relationship_edges(subject_id);
    CREATE INDEX IF NOT EXISTS idx_edges_object ON relationship_edges(object_id);
    CREATE INDEX IF NOT EXISTS idx_edges_pending ON relationship_edges(pending_delete);

    CREATE TABLE IF NOT EXISTS node_mentions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL REFERENCES canonical_nodes(id) ON DELETE CASCADE,
        context_id TEXT NOT NULL,
        raw_name TEXT NOT NULL,
        decision TEXT NOT NULL CHECK (decision IN ('created', 'exact_match', 'merged', 'low_confidence_merge')),
        score REAL NOT NULL,
        observed_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_mentions_node ON node_mentions(node_id);
"#;

/// Migration 2: structure hierarchy and the precomputed similarity index
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS structure_nodes (
        id TEXT PRIMARY KEY NOT NULL,
        structure_type TEXT NOT NULL,
        name TEXT NOT NULL,
        name_key TEXT NOT NULL,
        parent_id TEXT REFERENCES structure_nodes(id) ON DELETE SET NULL,
        parent_key TEXT NOT NULL DEFAULT '',
        mention_count INTEGER NOT NULL DEFAULT 0,
        context_count INTEGER NOT NULL DEFAULT 0,
        recent_contexts TEXT NOT NULL DEFAULT '[]',
        associated_node_ids TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        archived_at TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        UNIQUE (structure_type, name_key, parent_key)
    );

    CREATE INDEX IF NOT EXISTS idx_structures_type ON structure_nodes(structure_type);
    CREATE INDEX IF NOT EXISTS idx_structures_parent ON structure_nodes(parent_id);

    CREATE TABLE IF NOT EXISTS similarity_index (
        subject_id TEXT PRIMARY KEY NOT NULL REFERENCES canonical_nodes(id) ON DELETE CASCADE,
        item_kind TEXT NOT NULL,
        candidates TEXT NOT NULL DEFAULT '[]',
        computed_at TEXT NOT NULL,
        stale INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_similarity_kind ON similarity_index(item_kind);
"#;

/// Migration 3: per-edge decay marker
const MIGRATION_V3: &str = r#"
    ALTER TABLE relationship_edges ADD COLUMN last_decayed_at TEXT;
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Nodes, edges and mention audit");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Structure hierarchy and similarity index");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Edge decay marker");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub target_version: i32,
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);
        assert!(!needs_migration(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, CURRENT_VERSION as i64);
    }

    #[tokio::test]
    async fn test_tables_created() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        for table in [
            "canonical_nodes",
            "relationship_edges",
            "node_mentions",
            "structure_nodes",
            "similarity_index",
        ] {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_optional(&pool)
                    .await
                    .unwrap();
            assert!(row.is_some(), "table {} should exist", table);
        }
    }

    #[tokio::test]
    async fn test_v2_database_gains_decay_marker() {
        let pool = create_test_pool().await;
        sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(&pool).await.unwrap();
        sqlx::raw_sql(MIGRATION_V1).execute(&pool).await.unwrap();
        sqlx::raw_sql(MIGRATION_V2).execute(&pool).await.unwrap();
        record_migration(&pool, 1).await.unwrap();
        record_migration(&pool, 2).await.unwrap();
        assert!(needs_migration(&pool).await.unwrap());

        run_migrations(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('relationship_edges') WHERE name = 'last_decayed_at'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(migration_status(&pool).await.unwrap().current_version, 3);
    }

    #[tokio::test]
    async fn test_edge_triple_is_unique() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        for id in ["a", "b"] {
            sqlx::query(
                "INSERT INTO canonical_nodes (id, canonical_name, entity_type, first_seen, last_seen, confidence)
                 VALUES (?, ?, 'person', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z', 0.9)",
            )
            .bind(id)
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        }

        let insert = "INSERT INTO relationship_edges (id, subject_id, predicate, object_id, first_seen, last_seen)
                      VALUES (?, 'a', 'works_with', 'b', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')";
        sqlx::query(insert).bind("e1").execute(&pool).await.unwrap();
        let duplicate = sqlx::query(insert).bind("e2").execute(&pool).await;
        assert!(duplicate.is_err());
    }
}
