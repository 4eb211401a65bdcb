//! End-to-end smoke test for `Orchestrator::run` (spec §4.K, §8): a
//! full-replace table fetched from a mocked upstream should land in the lake
//! and `lastRunTimestamp` should advance on a clean run.

use std::collections::HashMap;
use std::sync::Arc;

use marketlake_core::config::{Config, DefaultsConfig, MaintenanceConfig, StorageConfig, WorkersConfig};
use marketlake_core::error::ExitCode;
use marketlake_core::persisted_state::LastRuns;
use marketlake_fetch::HttpFetcher;
use marketlake_orchestrator::Orchestrator;
use marketlake_schema::SchemaRegistry;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry() -> SchemaRegistry {
    SchemaRegistry::from_toml_str(
        r#"
[instruments]
primary_key = ["symbol"]
update_strategy = "full_replace"
update_by_symbol = false
upstream_api_id = "stock_basic"
"#,
    )
    .unwrap()
}

fn config(root: std::path::PathBuf) -> Config {
    Config {
        storage: StorageConfig { root },
        rate_limits: HashMap::new(),
        workers: WorkersConfig { fast: 2, slow: 2 },
        retry: HashMap::new(),
        groups: HashMap::from([("daily".to_string(), vec!["instruments".to_string()])]),
        tables: HashMap::new(),
        defaults: DefaultsConfig {
            start_date: "20200101".to_string(),
            end_date: "20201231".to_string(),
            market_close_hour: 16,
        },
        maintenance: MaintenanceConfig::default(),
    }
}

#[tokio::test]
async fn clean_run_writes_the_table_and_advances_last_run_timestamp() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stock_basic"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"symbol": "AAA"},
            {"symbol": "BBB"},
        ])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config(dir.path().to_path_buf()));
    let registry = Arc::new(registry());
    let fetcher = Arc::new(HttpFetcher::new(server.uri()).unwrap());

    let orchestrator = Orchestrator::new(config, registry, fetcher).await.unwrap();
    let code = orchestrator.run("daily", None).await;

    assert_eq!(code, ExitCode::Clean);
    let table_dir = dir.path().join("instruments");
    assert!(table_dir.exists());

    let runs = LastRuns::load(dir.path()).unwrap();
    assert!(runs.by_group.contains_key("daily"));
}

#[tokio::test]
async fn unknown_group_aborts_planning_without_touching_the_lake() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config(dir.path().to_path_buf()));
    let registry = Arc::new(registry());
    let fetcher = Arc::new(HttpFetcher::new(server.uri()).unwrap());

    let orchestrator = Orchestrator::new(config, registry, fetcher).await.unwrap();
    let code = orchestrator.run("nonexistent", None).await;

    assert_eq!(code, ExitCode::PlanningAborted);
    assert!(!dir.path().join("instruments").exists());
}

#[tokio::test]
async fn override_entities_marks_the_run_partial_and_does_not_advance_last_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stock_basic"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"symbol": "AAA"}])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config(dir.path().to_path_buf()));
    let registry = Arc::new(registry());
    let fetcher = Arc::new(HttpFetcher::new(server.uri()).unwrap());

    let orchestrator = Orchestrator::new(config, registry, fetcher).await.unwrap();
    let overrides = vec!["AAA".to_string()];
    let code = orchestrator.run("daily", Some(&overrides)).await;

    assert_eq!(code, ExitCode::Clean);
    let runs = LastRuns::load(dir.path()).unwrap();
    assert!(!runs.by_group.contains_key("daily"));
}
