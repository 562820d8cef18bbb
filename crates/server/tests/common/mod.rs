//! Common test utilities for server integration tests.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use migrator_core::testing::{fixtures, MockInstanceDirectory, MockJobEngine, MockPlacementService};
use migrator_core::{
    Config, InstanceDirectory, JobEngine, MigrationOrchestrator, MigrationStore,
    PlacementService, SqliteMigrationStore,
};
use migrator_server::state::AppState;

/// Instance registered in the mock directory of every fixture.
pub const VM: &str = "4a5b6c7d-1e2f-4a3b-8c9d-0e1f2a3b4c5d";

/// Test fixture with router and mock services.
pub struct TestFixture {
    pub router: Router,
    pub directory: MockInstanceDirectory,
    pub engine: Arc<MockJobEngine>,
    pub placement: Arc<MockPlacementService>,
    pub store: Arc<SqliteMigrationStore>,
    pub temp_dir: TempDir,
}

/// Response from a test request.
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a new test fixture with a fresh database and one VM on cn-1.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let config = create_test_config(&db_path);

        let store =
            Arc::new(SqliteMigrationStore::new(&db_path).expect("Failed to create store"));
        let directory = MockInstanceDirectory::new();
        directory.add_instance(fixtures::instance(VM, "cn-1")).await;
        let engine = Arc::new(MockJobEngine::with_directory(directory.clone()));
        let placement = Arc::new(MockPlacementService::with_servers(["cn-1", "cn-2"]));

        let orchestrator = MigrationOrchestrator::new(
            config.migration.clone(),
            Arc::clone(&store) as Arc<dyn MigrationStore>,
            Arc::clone(&engine) as Arc<dyn JobEngine>,
            Arc::clone(&placement) as Arc<dyn PlacementService>,
            Arc::new(directory.clone()) as Arc<dyn InstanceDirectory>,
        );

        let state = Arc::new(AppState::new(config, orchestrator));
        let router = migrator_server::api::create_router(state);

        Self {
            router,
            directory,
            engine,
            placement,
            store,
            temp_dir,
        }
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        let (status, bytes) = self.request("GET", path).await;
        TestResponse {
            status,
            body: parse_body(&bytes),
        }
    }

    /// Send a POST request without body. Migration parameters travel in the
    /// query string.
    pub async fn post(&self, path: &str) -> TestResponse {
        let (status, bytes) = self.request("POST", path).await;
        TestResponse {
            status,
            body: parse_body(&bytes),
        }
    }

    /// Run a migrate sub-action on the fixture VM.
    pub async fn migrate(&self, migration_action: &str) -> TestResponse {
        self.post(&format!(
            "/api/v1/vms/{}?action=migrate&migration_action={}",
            VM, migration_action
        ))
        .await
    }

    /// Send a GET request and return the body as text, one entry per line.
    pub async fn get_lines(&self, path: &str) -> (StatusCode, Vec<String>) {
        let (status, bytes) = self.request("GET", path).await;
        let text = String::from_utf8(bytes).expect("body should be UTF-8");
        let lines = text
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        (status, lines)
    }

    /// Poll the migration record until `predicate` holds.
    pub async fn wait_for_migration<F>(&self, predicate: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        let start = std::time::Instant::now();
        let path = format!("/api/v1/vms/{}/migrate", VM);
        loop {
            let response = self.get(&path).await;
            if response.status == StatusCode::OK && predicate(&response.body) {
                // Let the monitor release the instance.
                tokio::time::sleep(Duration::from_millis(10)).await;
                return response.body;
            }
            if start.elapsed() > Duration::from_secs(5) {
                panic!("timed out waiting for migration: {}", response.body);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the current action is no longer running.
    pub async fn wait_until_settled(&self, history_len: usize) -> Value {
        self.wait_for_migration(|m| {
            m["state"] != "running"
                && m["progress_history"]
                    .as_array()
                    .is_some_and(|h| h.len() >= history_len)
        })
        .await
    }

    async fn request(&self, method: &str, path: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        (status, body_bytes.to_vec())
    }
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).unwrap_or(Value::Null)
    }
}

/// Create a config pointing at unused service URLs; the fixture wires mocks.
pub fn create_test_config(db_path: &std::path::Path) -> Config {
    let toml = format!(
        r#"
[database]
path = "{}"

[job_engine]
url = "http://jobs.test"
api_token = "jobs-secret"

[placement]
url = "http://placement.test"

[directory]
url = "http://directory.test"
"#,
        db_path.display()
    );
    migrator_core::load_config_from_str(&toml).expect("test config should parse")
}
