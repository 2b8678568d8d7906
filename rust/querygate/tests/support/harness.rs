use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use querygate::{
    cache::{ContainerSource, InMemoryCacheStore, SourceError, SqlContainerSource},
    config::AppConfig,
    db,
    models::ContainerRecord,
    query::{postgres::PgBackend, BackendError, BoundQuery, ColumnInfo, Row, RowSet, SqlBackend},
    server::Server,
    state::{AppState, Backends},
    templates::{InMemoryTemplateStore, PgTemplateStore},
    time::ManualClock,
};
use regex::Regex;
use serde_json::{json, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Once},
    time::Duration,
};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

static PAGE_WINDOW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"OFFSET (\d+) ROWS FETCH NEXT (\d+) ROWS ONLY").unwrap());

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// Serves a fixed `items(id int4, name text)` table and records every statement it is
/// asked to run. Statements mentioning `broken_table` fail like a missing relation, and
/// `SELECT name, id ...` returns the columns in that order.
pub struct FakeBackend {
    rows: Vec<Row>,
    pub seen: Mutex<Vec<BoundQuery>>,
    pub reachable: Mutex<bool>,
}

impl FakeBackend {
    pub fn with_items(count: i64) -> Self {
        let rows = (1..=count)
            .map(|id| {
                let mut row = Row::new();
                row.insert("id".into(), json!(id));
                row.insert("name".into(), json!(format!("item-{id}")));
                row
            })
            .collect();
        Self {
            rows,
            seen: Mutex::new(Vec::new()),
            reachable: Mutex::new(true),
        }
    }

    fn columns() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo {
                name: "id".into(),
                data_type: "int4".into(),
            },
            ColumnInfo {
                name: "name".into(),
                data_type: "text".into(),
            },
        ]
    }
}

#[async_trait]
impl SqlBackend for FakeBackend {
    async fn fetch(
        &self,
        query: &BoundQuery,
        _timeout: Duration,
        max_rows: usize,
    ) -> Result<RowSet, BackendError> {
        self.seen.lock().push(query.clone());

        if query.sql.contains("broken_table") {
            return Err(BackendError::Other(
                "relation \"broken_table\" does not exist".into(),
            ));
        }

        if query.sql.starts_with("SELECT COUNT(*)") {
            let mut row = Row::new();
            row.insert("count".into(), json!(self.rows.len()));
            return Ok(RowSet {
                columns: vec![ColumnInfo {
                    name: "count".into(),
                    data_type: "int8".into(),
                }],
                rows: vec![row],
                truncated: false,
            });
        }

        let (offset, limit) = PAGE_WINDOW
            .captures(&query.sql)
            .map(|caps| (caps[1].parse().unwrap(), caps[2].parse().unwrap()))
            .unwrap_or((0, usize::MAX));
        let mut window: Vec<Row> = self.rows.iter().skip(offset).take(limit).cloned().collect();
        let mut columns = Self::columns();
        if query.sql.starts_with("SELECT name, id") {
            columns.reverse();
            window = window
                .into_iter()
                .map(|row| {
                    let mut reordered = Row::new();
                    reordered.insert("name".into(), row["name"].clone());
                    reordered.insert("id".into(), row["id"].clone());
                    reordered
                })
                .collect();
        }
        let truncated = window.len() > max_rows;
        Ok(RowSet {
            columns,
            rows: window.into_iter().take(max_rows).collect(),
            truncated,
        })
    }

    async fn ping(&self) -> Result<(), BackendError> {
        if *self.reachable.lock() {
            Ok(())
        } else {
            Err(BackendError::Pool("connection refused".into()))
        }
    }
}

/// Container source whose snapshot tests can swap between runs.
#[derive(Default)]
pub struct FakeContainers(pub Mutex<Vec<ContainerRecord>>);

impl FakeContainers {
    pub fn set_ids(&self, ids: &[i64]) {
        *self.0.lock() = ids
            .iter()
            .map(|id| ContainerRecord {
                id: *id,
                code: Some(format!("box{id}")),
                description: Some(format!("container {id}")),
                ..Default::default()
            })
            .collect();
    }
}

#[async_trait]
impl ContainerSource for FakeContainers {
    async fn load_all(&self) -> Result<Vec<ContainerRecord>, SourceError> {
        Ok(self.0.lock().clone())
    }
}

pub struct TestHarness {
    router: Router,
    pub backend: Arc<FakeBackend>,
    pub cache: Arc<InMemoryCacheStore>,
    pub containers: Arc<FakeContainers>,
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    /// Gateway over in-memory adapters with 25 items and API key enforcement.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        init_tracing();

        let mut config = AppConfig::embedded("postgres://unused/querygate".to_string());
        config.api_keys = vec![API_KEY.to_string()];
        adjust(&mut config);

        let backend = Arc::new(FakeBackend::with_items(25));
        let store = Arc::new(InMemoryTemplateStore::new());
        let cache = Arc::new(InMemoryCacheStore::new());
        let containers = Arc::new(FakeContainers::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));

        let state = AppState::new(
            Arc::new(config),
            Backends {
                sql: backend.clone(),
                templates: store.clone(),
                tags: store,
                cache: cache.clone(),
                containers: containers.clone(),
                clock: clock.clone(),
            },
        );

        Self {
            router: Server::from_state(state).router(),
            backend,
            cache,
            containers,
            clock,
        }
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        read_json(send(&self.router, "GET", path, None, true).await).await
    }

    pub async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        read_json(send(&self.router, "POST", path, Some(body), true).await).await
    }

    pub async fn put(&self, path: &str, body: Value) -> (StatusCode, Value) {
        read_json(send(&self.router, "PUT", path, Some(body), true).await).await
    }

    pub async fn delete(&self, path: &str) -> StatusCode {
        send(&self.router, "DELETE", path, None, true).await.status()
    }

    pub async fn post_without_api_key(&self, path: &str, body: Value) -> (StatusCode, Value) {
        read_json(send(&self.router, "POST", path, Some(body), false).await).await
    }

    pub async fn get_without_api_key(&self, path: &str) -> (StatusCode, Value) {
        read_json(send(&self.router, "GET", path, None, false).await).await
    }

    /// Posts `raw` verbatim as a JSON body, so malformed payloads reach the router.
    pub async fn post_raw(
        &self,
        path: &str,
        raw: &str,
        include_api_key: bool,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");
        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }
        let request = builder
            .body(Body::from(raw.to_string()))
            .expect("failed to build harness request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request");
        read_json(response).await
    }
}

async fn send(
    router: &Router,
    method: &str,
    path: &str,
    body: Option<Value>,
    include_api_key: bool,
) -> http::Response<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if include_api_key {
        builder = builder.header("x-api-key", API_KEY);
    }

    let request = match body {
        Some(payload) => builder
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::to_vec(&payload).expect("request payload should serialize"),
            )),
        None => builder.body(Body::empty()),
    }
    .expect("failed to build harness request");

    router
        .clone()
        .oneshot(request)
        .await
        .expect("router should handle harness request")
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    if bytes.is_empty() {
        return (status, Value::Null);
    }
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

/// Gateway wired to a real PostgreSQL database with the fixture schema applied. Skips
/// (returns `None`) unless `QUERYGATE_TEST_DATABASE_URL` is set.
pub struct PgHarness {
    router: Router,
    pub cache: Arc<InMemoryCacheStore>,
}

impl PgHarness {
    pub async fn connect() -> Option<Self> {
        init_tracing();

        let Ok(database_url) = env::var("QUERYGATE_TEST_DATABASE_URL") else {
            eprintln!("[querygate-test] skipping: QUERYGATE_TEST_DATABASE_URL is not set");
            return None;
        };

        let config = AppConfig::embedded(database_url);
        reset_fixture(&config)
            .await
            .expect("failed to load fixture schema");

        let client_pool = db::connect_client_pool(&config)
            .await
            .expect("query pool should build");
        let template_pool = db::connect_template_pool(&config)
            .await
            .expect("template pool should build");

        let sql: Arc<dyn SqlBackend> = Arc::new(PgBackend::new(client_pool));
        let store = Arc::new(PgTemplateStore::new(template_pool));
        let cache = Arc::new(InMemoryCacheStore::new());
        let containers = Arc::new(SqlContainerSource::new(
            Arc::clone(&sql),
            config.cache.source_query.clone(),
        ));

        let state = AppState::new(
            Arc::new(config),
            Backends {
                sql,
                templates: store.clone(),
                tags: store,
                cache: cache.clone(),
                containers,
                clock: Arc::new(querygate::time::SystemClock),
            },
        );

        Some(Self {
            router: Server::from_state(state).router(),
            cache,
        })
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        read_json(send(&self.router, "GET", path, None, false).await).await
    }

    pub async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        read_json(send(&self.router, "POST", path, Some(body), false).await).await
    }

    pub async fn put(&self, path: &str, body: Value) -> (StatusCode, Value) {
        read_json(send(&self.router, "PUT", path, Some(body), false).await).await
    }

    pub async fn delete(&self, path: &str) -> StatusCode {
        send(&self.router, "DELETE", path, None, false)
            .await
            .status()
    }
}

async fn reset_fixture(config: &AppConfig) -> anyhow::Result<()> {
    let pool = db::connect_client_pool(config).await?;
    let client = pool
        .get()
        .await
        .map_err(|err| anyhow::anyhow!("fixture connection failed: {err:?}"))?;
    let schema = load_fixture("schema.sql")?;
    client
        .batch_execute(&schema)
        .await
        .context("failed to apply fixture schema")?;
    Ok(())
}

fn load_fixture(name: &str) -> anyhow::Result<String> {
    let path = fixture_root().join(name);
    fs::read_to_string(&path)
        .with_context(|| format!("failed to read fixture {name} from {}", path.display()))
}

fn fixture_root() -> PathBuf {
    if let Ok(root) = env::var("QUERYGATE_FIXTURE_ROOT") {
        let candidate = PathBuf::from(root);
        if candidate.exists() {
            return candidate;
        }
    }

    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}
