//! Entigraph CLI - self-deduplicating knowledge graph

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use entigraph_core::config::EngineConfig;
use entigraph_core::domain::{
    EntityType, IngestReport, KnowledgeGraphEngine, NodeView, ObservationBatch, StructureTree,
};
use entigraph_core::infrastructure::SqliteGraphStore;
use entigraph_core::storage::{Database, DatabaseConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type Engine = KnowledgeGraphEngine<SqliteGraphStore>;

#[derive(Parser)]
#[command(name = "entigraph")]
#[command(author, version, about = "Self-deduplicating knowledge graph", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file (overrides storage.database_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest observations from a JSON Lines file (one batch per line)
    Ingest {
        /// Path to the .jsonl file
        file: PathBuf,
    },

    /// Look up an entity by name, alias or close spelling
    Lookup {
        name: String,
        /// Restrict to one entity type
        #[arg(short = 't', long = "type")]
        entity_type: Option<String>,
        /// Hide edges weaker than this
        #[arg(short = 's', long, default_value_t = 0.0)]
        min_strength: f64,
    },

    /// Fuzzy search over canonical names and aliases
    Search {
        query: String,
        #[arg(short = 't', long = "type")]
        entity_type: Option<String>,
        /// Maximum results (defaults to search.default_limit)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the discovered structure hierarchy
    Hierarchy {
        /// Only subtrees rooted at this structure type
        #[arg(short = 't', long = "type")]
        structure_type: Option<String>,
    },

    /// Graph statistics
    Stats {
        /// Number of most-mentioned entities to show
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Items similar to a node, from the similarity index
    Similar { item_id: String },

    /// Show the merge decisions behind a node
    Explain { node_id: String },

    /// Maintenance passes for an external scheduler
    Maintain {
        #[command(subcommand)]
        action: MaintainAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum MaintainAction {
    /// Purge flagged edges, decay unreinforced ones, prune weak ones
    Decay,
    /// Archive nodes not mentioned within the retention window
    ArchiveNodes,
    /// Rebuild the similarity index for one entity type
    RebuildIndex {
        #[arg(short, long)]
        kind: String,
    },
    /// Archive a structure node
    ArchiveStructure { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.quiet { "entigraph=warn" } else { "entigraph=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };
    let db = cli.db.as_deref();

    match cli.command {
        Commands::Ingest { file } => cmd_ingest(&open_engine(db).await?, &file, out).await,

        Commands::Lookup {
            name,
            entity_type,
            min_strength,
        } => {
            let engine = open_engine(db).await?;
            cmd_lookup(&engine, &name, entity_type.as_deref(), min_strength, out).await
        }

        Commands::Search {
            query,
            entity_type,
            limit,
        } => {
            let engine = open_engine(db).await?;
            cmd_search(&engine, &query, entity_type.as_deref(), limit, out).await
        }

        Commands::Hierarchy { structure_type } => {
            let engine = open_engine(db).await?;
            cmd_hierarchy(&engine, structure_type.as_deref(), out).await
        }

        Commands::Stats { top } => cmd_stats(&open_engine(db).await?, top, out).await,

        Commands::Similar { item_id } => cmd_similar(&open_engine(db).await?, &item_id, out).await,

        Commands::Explain { node_id } => cmd_explain(&open_engine(db).await?, &node_id, out).await,

        Commands::Maintain { action } => cmd_maintain(&open_engine(db).await?, action, out).await,

        Commands::Config { action } => cmd_config(action, out.quiet),

        Commands::Doctor => cmd_doctor(db, out.quiet).await,
    }
}

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn database_config(db_override: Option<&Path>, config: &EngineConfig) -> DatabaseConfig {
    let mut db_config = DatabaseConfig::from_storage(&config.storage);
    if let Some(path) = db_override {
        db_config.path = path.to_path_buf();
    }
    db_config
}

async fn open_engine(db_override: Option<&Path>) -> anyhow::Result<Engine> {
    let config = EngineConfig::load()?;
    let db = Database::new(database_config(db_override, &config)).await?;
    let store = Arc::new(SqliteGraphStore::new(db.pool().clone()));
    Ok(KnowledgeGraphEngine::new(store, config))
}

fn parse_type(raw: Option<&str>) -> anyhow::Result<Option<EntityType>> {
    Ok(raw.map(EntityType::parse).transpose()?)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_ingest(engine: &Engine, file: &Path, out: Output) -> anyhow::Result<()> {
    let contents = fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;

    let mut report = IngestReport::default();
    let mut batches = 0;
    let mut malformed_lines = Vec::new();

    for (index, line) in contents.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ObservationBatch>(line) {
            Ok(batch) => {
                batches += 1;
                report.merge(engine.ingest(&batch).await);
            }
            Err(e) => {
                warn!(line = line_no, error = %e, raw = %line, "Skipping malformed batch line");
                malformed_lines.push(line_no);
            }
        }
    }

    info!(file = %file.display(), batches, malformed = malformed_lines.len(), "Ingest finished");

    if out.json() {
        return print_json(&serde_json::json!({
            "batches": batches,
            "malformed_lines": malformed_lines,
            "report": report,
        }));
    }

    if !out.quiet {
        println!("Ingested {} batch(es) from {}", batches, file.display());
        println!(
            "  Entities:      {} ({} new, {} low-confidence merges)",
            report.entities_resolved, report.nodes_created, report.low_confidence_merges
        );
        println!("  Relationships: {}", report.relationships_observed);
        println!("  Structures:    {}", report.structures_observed);
        println!("  Rejected:      {}", report.rejected.len());
        for rejected in &report.rejected {
            println!("    [{}] {:?}: {}", rejected.code, rejected.kind, rejected.error);
        }
        if !malformed_lines.is_empty() {
            println!("  Malformed lines: {:?}", malformed_lines);
        }
    }
    Ok(())
}

async fn cmd_lookup(
    engine: &Engine,
    name: &str,
    entity_type: Option<&str>,
    min_strength: f64,
    out: Output,
) -> anyhow::Result<()> {
    let entity_type = parse_type(entity_type)?;
    let view = engine
        .lookup(name, entity_type.as_ref(), min_strength)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No entity matches '{}'", name))?;

    if out.json() {
        return print_json(&view);
    }
    print_node_view(&view);
    Ok(())
}

fn print_node_view(view: &NodeView) {
    let node = &view.node;
    println!("{} [{}]", node.canonical_name, node.entity_type);
    println!("  ID:          {}", node.id);
    println!(
        "  Aliases:     {}",
        node.aliases.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    println!("  Mentions:    {}", node.mention_count);
    println!("  Confidence:  {:.2}", node.confidence);
    println!("  Last seen:   {}", node.last_seen.format("%Y-%m-%d %H:%M"));
    if view.match_score < 1.0 {
        println!("  Match score: {:.2}", view.match_score);
    }
    if !node.metadata.is_empty() {
        println!("  Metadata:    {}", serde_json::Value::Object(node.metadata.clone()));
    }

    if !view.outgoing.is_empty() {
        println!();
        println!("Outgoing:");
        for edge in &view.outgoing {
            println!(
                "  -[{}]-> {} (strength {:.2}, {} mentions)",
                edge.edge.predicate, edge.other_name, edge.edge.strength, edge.edge.mention_count
            );
        }
    }
    if !view.incoming.is_empty() {
        println!();
        println!("Incoming:");
        for edge in &view.incoming {
            println!(
                "  <-[{}]- {} (strength {:.2}, {} mentions)",
                edge.edge.predicate, edge.other_name, edge.edge.strength, edge.edge.mention_count
            );
        }
    }
}

async fn cmd_search(
    engine: &Engine,
    query: &str,
    entity_type: Option<&str>,
    limit: Option<usize>,
    out: Output,
) -> anyhow::Result<()> {
    let entity_type = parse_type(entity_type)?;
    let limit = limit.unwrap_or(engine.config().search.default_limit);
    let hits = engine.search(query, entity_type.as_ref(), limit).await?;

    if out.json() {
        return print_json(&hits);
    }
    if hits.is_empty() {
        if !out.quiet {
            println!("No matches for '{}'", query);
        }
        return Ok(());
    }
    for hit in &hits {
        println!(
            "{:.2}  {} [{}]  {}",
            hit.score, hit.node.canonical_name, hit.node.entity_type, hit.node.id
        );
    }
    Ok(())
}

async fn cmd_hierarchy(engine: &Engine, structure_type: Option<&str>, out: Output) -> anyhow::Result<()> {
    let forest = engine.hierarchy(structure_type).await?;

    if out.json() {
        return print_json(&forest);
    }
    if forest.is_empty() {
        if !out.quiet {
            println!("No structure discovered yet.");
        }
        return Ok(());
    }
    for tree in &forest {
        print_tree(tree, 0);
    }
    Ok(())
}

fn print_tree(tree: &StructureTree, depth: usize) {
    let node = &tree.node;
    println!(
        "{}- {} ({}) mentions {}, contexts {}, {} linked",
        "  ".repeat(depth),
        node.name,
        node.structure_type,
        node.mention_count,
        node.context_count,
        node.associated_node_ids.len()
    );
    for child in &tree.children {
        print_tree(child, depth + 1);
    }
}

async fn cmd_stats(engine: &Engine, top: usize, out: Output) -> anyhow::Result<()> {
    let stats = engine.stats(top).await?;

    if out.json() {
        return print_json(&stats);
    }

    println!("Knowledge Graph Statistics");
    println!("==========================");
    println!("Nodes:      {} active, {} archived", stats.active_nodes(), stats.archived_nodes);
    for (entity_type, count) in &stats.nodes_by_type {
        println!("  {:<16} {}", entity_type, count);
    }
    println!("Edges:      {} active, {} archived", stats.active_edges(), stats.archived_edges);
    for (predicate, count) in &stats.edges_by_predicate {
        println!("  {:<16} {}", predicate, count);
    }
    println!("Structures: {}", stats.structure_nodes);
    println!(
        "Index:      {} entries, {} stale",
        stats.index_entries, stats.stale_index_entries
    );
    if !stats.top_mentioned.is_empty() {
        println!();
        println!("Most mentioned:");
        for entity in &stats.top_mentioned {
            println!(
                "  {:>5}  {} [{}]",
                entity.mention_count, entity.canonical_name, entity.entity_type
            );
        }
    }
    Ok(())
}

async fn cmd_similar(engine: &Engine, item_id: &str, out: Output) -> anyhow::Result<()> {
    let lookup = engine.similar_items(item_id).await?;

    if out.json() {
        return print_json(&lookup);
    }

    if !out.quiet {
        let source = if lookup.from_index { "index" } else { "on-the-fly scan" };
        let freshness = if lookup.stale { ", stale" } else { "" };
        println!("Similar to {} ({}{})", lookup.subject_id, source, freshness);
    }
    for candidate in &lookup.candidates {
        let name = match engine.get_node(&candidate.item_id).await {
            Ok(node) => node.canonical_name,
            Err(_) => candidate.item_id.clone(),
        };
        println!("  {:.2}  {}  {}", candidate.score, name, candidate.explanation);
    }
    Ok(())
}

async fn cmd_explain(engine: &Engine, node_id: &str, out: Output) -> anyhow::Result<()> {
    let explanation = engine.explain_node(node_id).await?;

    if out.json() {
        return print_json(&explanation);
    }

    let node = &explanation.node;
    println!("{} [{}] {}", node.canonical_name, node.entity_type, node.id);
    if node.archived_at.is_some() {
        println!("  (archived)");
    }
    for mention in &explanation.mentions {
        println!(
            "  {}  {:<20} {:.2}  '{}'  context {}{}",
            mention.observed_at.format("%Y-%m-%d %H:%M:%S"),
            mention.decision,
            mention.score,
            mention.raw_name,
            mention.context_id,
            if mention.is_flagged() { "  [flagged]" } else { "" }
        );
    }
    Ok(())
}

async fn cmd_maintain(engine: &Engine, action: MaintainAction, out: Output) -> anyhow::Result<()> {
    match action {
        MaintainAction::Decay => {
            let report = engine.decay_and_prune(Utc::now()).await?;
            if out.json() {
                return print_json(&report);
            }
            if !out.quiet {
                println!(
                    "Decay pass: {} purged, {} decayed, {} pruned, {} skipped",
                    report.purged, report.decayed, report.pruned, report.skipped
                );
            }
        }
        MaintainAction::ArchiveNodes => {
            let report = engine.archive_stale_nodes(Utc::now()).await?;
            if out.json() {
                return print_json(&report);
            }
            if !out.quiet {
                println!("Archived {} stale node(s)", report.archived.len());
            }
        }
        MaintainAction::RebuildIndex { kind } => {
            let kind = EntityType::parse(&kind)?;
            let cancel = CancellationToken::new();

            let on_interrupt = cancel.clone();
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping index rebuild");
                    on_interrupt.cancel();
                }
            });

            let report = engine.rebuild_index(&kind, &cancel).await;
            watcher.abort();
            let report = report?;

            if out.json() {
                print_json(&report)?;
            } else if !out.quiet {
                println!(
                    "Rebuilt {}/{} index entries for {}",
                    report.rebuilt, report.total, report.item_kind
                );
            }
            report.into_result()?;
        }
        MaintainAction::ArchiveStructure { id } => {
            let node = engine.archive_structure(&id).await?;
            if out.json() {
                return print_json(&node);
            }
            if !out.quiet {
                println!("Archived structure '{}' ({})", node.name, node.id);
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = EngineConfig::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = EngineConfig::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = EngineConfig::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            EngineConfig::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = EngineConfig::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(db_override: Option<&Path>, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Entigraph Health Check");
        println!("======================");
        println!();
    }

    let mut all_ok = true;

    let config = match EngineConfig::load() {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid");
            }
            config
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
            EngineConfig::default()
        }
    };

    if !quiet {
        match EngineConfig::config_path() {
            Ok(path) if path.exists() => println!("[OK] Config file: {}", path.display()),
            Ok(path) => println!("[--] Config file: {} (using defaults)", path.display()),
            Err(e) => println!("[!!] Config file: Error - {}", e),
        }
    }

    match Database::new(database_config(db_override, &config)).await {
        Ok(db) => match db.health_check().await {
            Ok(()) => {
                if !quiet {
                    println!("[OK] Database: Connected");
                    println!("     Path: {}", db.path().display());
                }
                match db.migration_status().await {
                    Ok(status) if status.needs_migration => {
                        all_ok = false;
                        if !quiet {
                            println!(
                                "[!!] Database: Migrations pending (v{} -> v{})",
                                status.current_version, status.target_version
                            );
                        }
                    }
                    Ok(status) => {
                        if !quiet {
                            println!("[OK] Database: Schema v{}", status.current_version);
                        }
                    }
                    Err(e) => {
                        all_ok = false;
                        if !quiet {
                            println!("[!!] Database: Migration check failed - {}", e);
                        }
                    }
                }

                let engine = KnowledgeGraphEngine::new(
                    Arc::new(SqliteGraphStore::new(db.pool().clone())),
                    config,
                );
                if let Ok(stats) = engine.stats(0).await {
                    if !quiet {
                        println!(
                            "     Nodes: {}, edges: {}, stale index entries: {}",
                            stats.active_nodes(),
                            stats.active_edges(),
                            stats.stale_index_entries
                        );
                    }
                }
            }
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Database: Health check failed - {}", e);
                }
            }
        },
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Database: Failed to initialize - {}", e);
            }
        }
    }

    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }

    if !all_ok {
        anyhow::bail!("Health check failed");
    }
    Ok(())
}
