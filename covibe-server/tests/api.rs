//! HTTP API acceptance tests.
//!
//! Starts a real listener with scripted build and publish providers and
//! drives it over HTTP: intake validation, rate limiting, status polling,
//! cancellation, the state snapshot and artifact serving.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use covibe_pipeline::{
    BuildProvider, ProviderError, PublishError, PublishRequest, Publisher, UploadStrategy,
};
use covibe_server::config::ServerConfig;
use covibe_server::server::Server;
use serde_json::{Value, json};

struct WellBehaved;

#[async_trait]
impl BuildProvider for WellBehaved {
    async fn generate(&self, request: &str, module_id: &str) -> Result<String, ProviderError> {
        Ok(format!(
            "(function() {{\n  function createCard() {{\n    const card = document.createElement('div');\n    card.className = 'card';\n    card.textContent = {request:?};\n    return card;\n  }}\n  window.registerFeature('{module_id}', createCard);\n}})();"
        ))
    }
}

/// Never answers, so submissions park in GENERATING.
struct Stalled;

#[async_trait]
impl BuildProvider for Stalled {
    async fn generate(&self, _: &str, _: &str) -> Result<String, ProviderError> {
        std::future::pending().await
    }
}

/// Accepts every release and serves one file only it holds.
struct Remote;

#[async_trait]
impl Publisher for Remote {
    async fn publish(&self, _: &PublishRequest) -> Result<UploadStrategy, PublishError> {
        Ok(UploadStrategy::Api)
    }

    fn branch(&self) -> &str {
        "main"
    }

    async fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>, PublishError> {
        Ok((path == "public/features/feature-900.js").then(|| b"// remote copy".to_vec()))
    }
}

struct TestServer {
    addr: SocketAddr,
    base: String,
    client: reqwest::Client,
    _site: tempfile::TempDir,
    _handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_with(
    provider: Arc<dyn BuildProvider>,
    adjust: impl FnOnce(&mut ServerConfig),
) -> TestServer {
    let site = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        db_path: None,
        site_dir: site.path().to_path_buf(),
        retry_backoff_ms: 1,
        reconcile_interval_secs: 0,
        ..Default::default()
    };
    adjust(&mut config);
    let server = Server::with_collaborators(config, provider, Arc::new(Remote));
    let (addr, handle): (SocketAddr, _) = server.start().await.unwrap();
    TestServer {
        addr,
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _site: site,
        _handle: handle,
    }
}

async fn start() -> TestServer {
    start_with(Arc::new(WellBehaved), |_| {}).await
}

impl TestServer {
    async fn submit(&self, request: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/api/submit", self.base))
            .json(&json!({ "request": request }))
            .send()
            .await
            .unwrap()
    }

    async fn submission(&self, id: i64) -> reqwest::Response {
        self.client
            .get(format!("{}/api/submissions/{id}", self.base))
            .send()
            .await
            .unwrap()
    }

    async fn cancel(&self, id: i64) -> reqwest::Response {
        self.client
            .post(format!("{}/api/submissions/{id}/cancel", self.base))
            .send()
            .await
            .unwrap()
    }

    /// Poll until the submission leaves the pipeline.
    async fn wait_terminal(&self, id: i64) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let body: Value = self.submission(id).await.json().await.unwrap();
            let status = body["status"].as_str().unwrap_or_default().to_string();
            if matches!(status.as_str(), "RELEASED" | "REJECTED" | "FAILED" | "CANCELLED") {
                return body;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "submission #{id} stuck in {status}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn submit_ok(server: &TestServer, request: &str) -> i64 {
    let resp = server.submit(request).await;
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "RECEIVED");
    body["submissionId"].as_i64().unwrap()
}

// ── Lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn todo_list_released_and_served() {
    let server = start().await;
    let id = submit_ok(&server, "add a todo list").await;

    let done = server.wait_terminal(id).await;
    assert_eq!(done["status"], "RELEASED", "{done}");
    assert_eq!(done["usedAI"], true);
    assert_eq!(done["release"]["strategy"], "api");

    let file = done["featureFile"].as_str().unwrap();
    let resp = server
        .client
        .get(format!("{}/features/{file}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("application/javascript"));
    assert!(resp.text().await.unwrap().contains("registerFeature"));
}

#[tokio::test]
async fn hostile_request_rejected() {
    let server = start().await;
    let id = submit_ok(&server, "write an xss attack script").await;

    let done = server.wait_terminal(id).await;
    assert_eq!(done["status"], "REJECTED");
    assert_eq!(done["review"]["approved"], false);
}

#[tokio::test]
async fn state_lists_features_and_recent_submissions() {
    let server = start().await;
    let id = submit_ok(&server, "add a counter").await;
    server.wait_terminal(id).await;

    let state: Value = server
        .client
        .get(format!("{}/api/state", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let features = state["releasedFeatures"].as_array().unwrap();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0]["id"], id);

    let recent = &state["recentSubmissions"][0];
    assert_eq!(recent["id"], id);
    assert_eq!(recent["request"], "add a counter");
    assert_eq!(recent["status"], "RELEASED");
    assert!(recent["createdAt"].is_string());
    // Pipeline internals stay out of the public listing.
    assert!(recent.get("artifact").is_none());
    assert!(recent.get("version").is_none());
}

// ── Intake ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_requests_rejected_at_intake() {
    let server = start().await;

    let long = "x".repeat(201);
    for request in ["", "   ", long.as_str(), "ring\u{7}bell"] {
        let resp = server.submit(request).await;
        assert_eq!(resp.status(), 400, "{request:?}");
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("REQUEST_"));
    }

    let resp = server
        .client
        .post(format!("{}/api/submit", server.base))
        .header("content-type", "application/json")
        .body("{\"nope\": 1}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn rate_limit_per_client() {
    let server = start_with(Arc::new(WellBehaved), |c| c.rate_limit = 2).await;

    assert_eq!(server.submit("add a note").await.status(), 202);
    assert_eq!(server.submit("add a timer").await.status(), 202);
    let resp = server.submit("add a picker").await;
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "RATE_LIMITED");
}

// ── Cancellation ───────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_then_conflict_then_not_found() {
    let server = start_with(Arc::new(Stalled), |_| {}).await;
    let id = submit_ok(&server, "add a todo list").await;

    let resp = server.cancel(id).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(body["error"], "CANCELLED_BY_USER");

    let resp = server.cancel(id).await;
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "NOT_CANCELLABLE");

    assert_eq!(server.cancel(9999).await.status(), 404);
    assert_eq!(server.submission(9999).await.status(), 404);
}

// ── Artifacts and health ───────────────────────────────────────────────

#[tokio::test]
async fn feature_files_fall_back_to_publisher() {
    let server = start().await;
    let get = |name: &str| {
        server
            .client
            .get(format!("{}/features/{name}", server.base))
            .send()
    };

    let resp = get("feature-900.js").await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "// remote copy");

    assert_eq!(get("feature-901.js").await.unwrap().status(), 404);
    assert_eq!(get(".env.js").await.unwrap().status(), 400);
    assert_eq!(get("feature-1.txt").await.unwrap().status(), 400);
}

#[tokio::test]
async fn busy_port_moves_to_the_next_one() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let server = start_with(Arc::new(WellBehaved), |c| {
        c.listen_addr = format!("127.0.0.1:{port}");
    })
    .await;
    let bound = u32::from(server.addr.port());
    assert!(bound > u32::from(port) && bound < u32::from(port) + 10);

    let resp = server
        .client
        .get(format!("{}/api/v1/health", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn health() {
    let server = start().await;
    let body: Value = server
        .client
        .get(format!("{}/api/v1/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}
