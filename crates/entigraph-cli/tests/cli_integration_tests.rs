//! CLI integration tests for entigraph
//!
//! Runs the binary end to end against a throwaway config dir and database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const BATCHES: &str = r#"{"entities":[{"name":"Jef","entity_type":"person","confidence":0.9,"source_context_id":"m1"},{"name":"Menu Team","entity_type":"team","confidence":0.9,"context_id":"m1","structure":{"structure_type":"team","name":"Menu Team","parent_type":"pillar","parent_name":"Customer Pillar"}},{"name":"Phoenix","entity_type":"project","confidence":0.8,"source_context_id":"m1"}],"relationships":[{"subject":"Jef","subject_type":"person","predicate":"works_on","object":"Phoenix","object_type":"project","confidence":0.8,"source_context_id":"m1"}]}
{"entities":[{"name":"jef adriaenssens","entity_type":"person","confidence":0.95,"source_context_id":"m2"}]}
this line is not json

{"entities":[{"name":"  ","entity_type":"person","confidence":0.9,"source_context_id":"m3"}]}
"#;

/// Command isolated to `dir` for both config and the default database
#[allow(deprecated)]
fn entigraph_cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("entigraph").unwrap();
    cmd.env("ENTIGRAPH_CONFIG_DIR", dir);
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_batches(dir: &Path) -> PathBuf {
    let path = dir.join("observations.jsonl");
    std::fs::write(&path, BATCHES).unwrap();
    path
}

fn ingest_fixture(dir: &Path) {
    let file = write_batches(dir);
    entigraph_cmd(dir)
        .args(["ingest", file.to_str().unwrap()])
        .assert()
        .success();
}

fn node_id(dir: &Path, name: &str) -> String {
    let output = entigraph_cmd(dir)
        .args(["--format", "json", "lookup", name])
        .output()
        .unwrap();
    assert!(output.status.success());
    let view: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    view["node"]["id"].as_str().unwrap().to_string()
}

#[test]
fn test_config_path_uses_env_dir() {
    let temp_dir = TempDir::new().unwrap();

    entigraph_cmd(temp_dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"))
        .stdout(predicate::str::contains(temp_dir.path().to_str().unwrap()));
}

#[test]
fn test_config_set_get_reset() {
    let temp_dir = TempDir::new().unwrap();

    entigraph_cmd(temp_dir.path())
        .args(["config", "set", "search.default_limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set search.default_limit = 5"));

    entigraph_cmd(temp_dir.path())
        .args(["config", "get", "search.default_limit"])
        .assert()
        .success()
        .stdout(predicate::str::diff("5\n"));

    entigraph_cmd(temp_dir.path())
        .args(["config", "reset"])
        .assert()
        .success();

    entigraph_cmd(temp_dir.path())
        .args(["config", "get", "search.default_limit"])
        .assert()
        .success()
        .stdout(predicate::str::diff("10\n"));
}

#[test]
fn test_config_rejects_invalid_threshold() {
    let temp_dir = TempDir::new().unwrap();

    entigraph_cmd(temp_dir.path())
        .args(["config", "set", "resolver.merge_threshold", "1.5"])
        .assert()
        .failure();

    entigraph_cmd(temp_dir.path())
        .args(["config", "get", "no.such.key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_ingest_reports_rejections_and_malformed_lines() {
    let temp_dir = TempDir::new().unwrap();
    let file = write_batches(temp_dir.path());

    entigraph_cmd(temp_dir.path())
        .args(["ingest", file.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ingested 3 batch(es)"))
        .stdout(predicate::str::contains("Rejected:      1"))
        .stdout(predicate::str::contains("Malformed lines: [3]"));
}

#[test]
fn test_ingest_json_output() {
    let temp_dir = TempDir::new().unwrap();
    let file = write_batches(temp_dir.path());

    let output = entigraph_cmd(temp_dir.path())
        .args(["--format", "json", "ingest", file.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["batches"], 3);
    assert_eq!(summary["malformed_lines"][0], 3);
    assert_eq!(summary["report"]["relationships_observed"], 1);
    assert_eq!(summary["report"]["structures_observed"], 1);
    assert_eq!(summary["report"]["rejected"][0]["code"], "E001");
}

#[test]
fn test_ingest_missing_file_fails() {
    let temp_dir = TempDir::new().unwrap();

    entigraph_cmd(temp_dir.path())
        .args(["ingest", "does-not-exist.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_lookup_shows_edges() {
    let temp_dir = TempDir::new().unwrap();
    ingest_fixture(temp_dir.path());

    entigraph_cmd(temp_dir.path())
        .args(["lookup", "jef"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Jef [PERSON]"))
        .stdout(predicate::str::contains("-[WORKS_ON]-> Phoenix"));

    entigraph_cmd(temp_dir.path())
        .args(["lookup", "Phoenix", "--type", "project"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<-[WORKS_ON]- Jef"));
}

#[test]
fn test_lookup_unknown_name_fails() {
    let temp_dir = TempDir::new().unwrap();
    ingest_fixture(temp_dir.path());

    entigraph_cmd(temp_dir.path())
        .args(["lookup", "Zebediah Quartermaine"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No entity matches"));
}

#[test]
fn test_hierarchy_lists_discovered_structure() {
    let temp_dir = TempDir::new().unwrap();
    ingest_fixture(temp_dir.path());

    entigraph_cmd(temp_dir.path())
        .args(["hierarchy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("- Customer Pillar (pillar)"))
        .stdout(predicate::str::contains("  - Menu Team (team)"));
}

#[test]
fn test_stats_json() {
    let temp_dir = TempDir::new().unwrap();
    ingest_fixture(temp_dir.path());

    let output = entigraph_cmd(temp_dir.path())
        .args(["--format", "json", "stats", "--top", "2"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stats["nodes_by_type"]["PROJECT"], 1);
    assert_eq!(stats["edges_by_predicate"]["WORKS_ON"], 1);
    assert_eq!(stats["structure_nodes"], 2);
    assert_eq!(stats["top_mentioned"].as_array().unwrap().len(), 2);
}

#[test]
fn test_rebuild_index_then_similar() {
    let temp_dir = TempDir::new().unwrap();
    ingest_fixture(temp_dir.path());

    entigraph_cmd(temp_dir.path())
        .args(["maintain", "rebuild-index", "--kind", "person"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rebuilt 1/1 index entries for PERSON"));

    let id = node_id(temp_dir.path(), "Jef");
    entigraph_cmd(temp_dir.path())
        .args(["similar", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("(index)"));
}

#[test]
fn test_explain_lists_decisions() {
    let temp_dir = TempDir::new().unwrap();
    ingest_fixture(temp_dir.path());

    let id = node_id(temp_dir.path(), "Jef");
    entigraph_cmd(temp_dir.path())
        .args(["explain", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("created"))
        .stdout(predicate::str::contains("context m1"));

    entigraph_cmd(temp_dir.path())
        .args(["explain", "no-such-node"])
        .assert()
        .failure();
}

#[test]
fn test_maintenance_passes_on_fresh_graph() {
    let temp_dir = TempDir::new().unwrap();
    ingest_fixture(temp_dir.path());

    entigraph_cmd(temp_dir.path())
        .args(["maintain", "decay"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 purged, 0 decayed, 0 pruned"));

    entigraph_cmd(temp_dir.path())
        .args(["maintain", "archive-nodes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Archived 0 stale node(s)"));

    entigraph_cmd(temp_dir.path())
        .args(["maintain", "archive-structure", "missing"])
        .assert()
        .failure();
}

#[test]
fn test_db_flag_selects_database_file() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("custom").join("kg.db");
    let file = write_batches(temp_dir.path());

    entigraph_cmd(temp_dir.path())
        .args(["--db", db_path.to_str().unwrap(), "ingest", file.to_str().unwrap()])
        .assert()
        .success();
    assert!(db_path.exists());

    // the default database stays empty
    entigraph_cmd(temp_dir.path())
        .args(["search", "Phoenix"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No matches"));

    entigraph_cmd(temp_dir.path())
        .args(["--db", db_path.to_str().unwrap(), "search", "Phoenix"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Phoenix [PROJECT]"));
}

#[test]
fn test_doctor_passes() {
    let temp_dir = TempDir::new().unwrap();

    entigraph_cmd(temp_dir.path())
        .args(["doctor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[OK] Database: Connected"))
        .stdout(predicate::str::contains("All checks passed!"));
}

#[test]
fn test_doctor_fails_on_invalid_config() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
        temp_dir.path().join("config.toml"),
        "[retention]\nnode_retention_days = 1000000000\n",
    )
    .unwrap();

    entigraph_cmd(temp_dir.path())
        .args(["doctor"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[!!] Configuration: Error"))
        .stdout(predicate::str::contains("Some checks failed"))
        .stderr(predicate::str::contains("Health check failed"));

    entigraph_cmd(temp_dir.path())
        .args(["--quiet", "doctor"])
        .assert()
        .failure();
}

#[test]
fn test_config_set_rejects_oversized_retention() {
    let temp_dir = TempDir::new().unwrap();

    entigraph_cmd(temp_dir.path())
        .args(["config", "set", "retention.node_retention_days", "1000000000"])
        .assert()
        .failure();

    entigraph_cmd(temp_dir.path())
        .args(["maintain", "archive-nodes"])
        .assert()
        .success();
}

#[test]
fn test_invalid_type_flag_fails() {
    let temp_dir = TempDir::new().unwrap();

    entigraph_cmd(temp_dir.path())
        .args(["search", "Phoenix", "--type", "bad type!"])
        .assert()
        .failure();
}
