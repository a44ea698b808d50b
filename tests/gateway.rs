//! Gateway routes exercised over a real socket.

use std::sync::Arc;

use liath::config::{Config, StorageBackendKind};
use liath::{gateway, Liath};
use serde_json::{json, Value};
use tempfile::TempDir;

struct TestServer {
    base: String,
    client: reqwest::Client,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.storage.backend = StorageBackendKind::Memory;
        config.gateway.body_limit_bytes = 4096;

        let liath = Arc::new(Liath::open(config.clone()).unwrap());
        let app = gateway::router(liath, &config.gateway);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn query_returns_value_or_rendering() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            "/query",
            json!({"namespace": "default", "query": "kv.put('k', {1, 2}); return kv.get('k')"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    assert_eq!(body["format"], "dict");
    assert_eq!(body["result"], json!([1, 2]));

    let (status, body) = server
        .post(
            "/query",
            json!({"namespace": "default", "query": "return {a = 1}", "format": "yaml"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"], "a: 1\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn errors_carry_kind_and_status() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post("/query", json!({"namespace": "ghost", "query": "return 1"}))
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"], "namespace_not_found");

    let (status, body) = server
        .post(
            "/query",
            json!({"namespace": "default", "query": "return 1", "format": "xml"}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "unsupported_format");

    let (status, body) = server
        .post("/query", json!({"namespace": "default", "query": "error('boom')"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "script_execution_error");
    assert!(body["message"].as_str().unwrap().contains("boom"));

    let (status, body) = server.post("/query", json!({"namespace": "default"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test(flavor = "multi_thread")]
async fn users_and_login() {
    let server = TestServer::start().await;
    let creds = json!({"username": "alice", "password": "pw"});

    let (status, _) = server.post("/create_user", creds.clone()).await;
    assert_eq!(status, 200);
    let (status, body) = server.post("/create_user", creds.clone()).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"], "user_already_exists");

    let (status, body) = server.post("/login", creds).await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Logged in successfully");

    let (status, body) = server
        .post("/login", json!({"username": "alice", "password": "wrong"}))
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "invalid_credentials");
}

#[tokio::test(flavor = "multi_thread")]
async fn namespace_management() {
    let server = TestServer::start().await;

    let (status, _) = server
        .post("/create_namespace", json!({"namespace": "tenant", "packages": ["lpeg"]}))
        .await;
    assert_eq!(status, 200);

    let response = server
        .client
        .get(format!("{}/list_namespaces", server.base))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["namespaces"], json!(["default", "tenant"]));

    let (_, body) = server
        .post("/install_package", json!({"namespace": "tenant", "package": "lpeg"}))
        .await;
    assert_eq!(body["installed"], false);
    let (_, body) = server
        .post("/install_package", json!({"namespace": "tenant", "package": "json"}))
        .await;
    assert_eq!(body["installed"], true);

    let (status, body) = server
        .post("/create_namespace", json!({"namespace": "bad name!"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_namespace_name");
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_bodies_are_rejected() {
    let server = TestServer::start().await;
    let query = format!("return '{}'", "x".repeat(8192));
    let response = server
        .client
        .post(format!("{}/query", server.base))
        .json(&json!({"namespace": "default", "query": query}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 413);
}
