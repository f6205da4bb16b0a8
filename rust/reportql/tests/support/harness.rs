use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use reportql::{
    config::AppConfig,
    error::{Result, ServiceError},
    server::Server,
    sql::Statement,
    store::{ObjectStorage, QueryExecutor, ResultColumn, ResultSet, Row},
};
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, Once},
    time::Duration,
};
use tower::ServiceExt;

const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

/// Records every statement and replays canned results picked by SQL fragment.
#[derive(Default)]
pub struct FakeExecutor {
    statements: Mutex<Vec<Statement>>,
    responses: Mutex<Vec<(String, ResultSet)>>,
    failure: Mutex<Option<String>>,
}

impl FakeExecutor {
    /// Statements whose SQL contains `fragment` get `result`. First match wins.
    pub fn respond(&self, fragment: &str, result: ResultSet) {
        self.responses
            .lock()
            .unwrap()
            .push((fragment.to_string(), result));
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().unwrap().clone()
    }

    pub fn statement_containing(&self, fragment: &str) -> Statement {
        self.statements()
            .into_iter()
            .find(|statement| statement.sql.contains(fragment))
            .unwrap_or_else(|| panic!("no statement contains {fragment:?}"))
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        self.fetch_all(statement).await.map(|_| ())
    }

    async fn fetch_all(&self, statement: &Statement) -> Result<ResultSet> {
        self.statements.lock().unwrap().push(statement.clone());
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(ServiceError::executor("query", message));
        }
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(fragment, _)| statement.sql.contains(fragment.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<Vec<StoredObject>>,
}

impl FakeStorage {
    pub fn objects(&self) -> Vec<StoredObject> {
        self.objects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put(&self, object: &str, bytes: Vec<u8>, content_type: &'static str) -> Result<()> {
        self.objects.lock().unwrap().push(StoredObject {
            path: object.to_string(),
            bytes,
            content_type,
        });
        Ok(())
    }

    async fn presigned_url(&self, object: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "https://storage.test/{object}?expires={}",
            ttl.as_secs()
        ))
    }
}

pub struct TestHarness {
    router: Router,
    pub executor: Arc<FakeExecutor>,
    pub storage: Arc<FakeStorage>,
}

/// A router wired to in-memory store fakes, with an API key configured.
pub fn harness() -> TestHarness {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let mut config = AppConfig::embedded("http://clickhouse.test:8123".to_string());
    config.api_key = Some(API_KEY.to_string());

    let executor = Arc::new(FakeExecutor::default());
    let storage = Arc::new(FakeStorage::default());
    let server = Server::with_services(
        config,
        Arc::clone(&executor) as Arc<dyn QueryExecutor>,
        Arc::clone(&storage) as Arc<dyn ObjectStorage>,
    );

    TestHarness {
        router: server.router(),
        executor,
        storage,
    }
}

impl TestHarness {
    pub async fn post(&self, path: &str, payload: Value) -> http::Response<Body> {
        self.request("POST", path, Some(payload), true).await
    }

    pub async fn post_without_api_key(&self, path: &str, payload: Value) -> http::Response<Body> {
        self.request("POST", path, Some(payload), false).await
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.request("GET", path, None, true).await
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        payload: Option<Value>,
        include_api_key: bool,
    ) -> http::Response<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }

        let body = match payload {
            Some(payload) => {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&payload).expect("payload should serialize"))
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("failed to build harness request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

/// A canned result set; `columns` are `(name, type)` pairs.
pub fn result_set(columns: &[(&str, &str)], rows: Value) -> ResultSet {
    ResultSet {
        columns: columns
            .iter()
            .map(|(name, data_type)| ResultColumn {
                name: name.to_string(),
                data_type: data_type.to_string(),
            })
            .collect(),
        rows: serde_json::from_value::<Vec<Row>>(rows).expect("rows should be objects"),
    }
}
