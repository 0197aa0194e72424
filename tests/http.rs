mod common;

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use common::{eventually, Harness};
use playground::http_server::{router, run_server};
use playground::state::AppState;
use playground::{Dispatcher, ExecutionMode, ExecutionReport, OutcomeTag, QueuePolicy, Stage};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Server {
    addr: SocketAddr,
    state: AppState,
    client: reqwest::Client,
    _shutdown: oneshot::Sender<()>,
}

impl Server {
    async fn start(dispatcher: Dispatcher, static_root: Option<&Path>) -> Self {
        let state = AppState::new(dispatcher);
        let app = router(state.clone(), static_root);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(run_server(listener, app, async move {
            let _ = rx.await;
        }));
        Server {
            addr,
            state,
            client: reqwest::Client::new(),
            _shutdown: tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client.post(self.url(path)).json(&body).send().await.unwrap()
    }
}

#[tokio::test]
async fn execute_returns_a_report_for_every_outcome() {
    let harness = Harness::new();
    let server = Server::start(harness.dispatcher(), None).await;

    let response = server.post("/execute", json!({"code": "echo hi"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let report: ExecutionReport = response.json().await.unwrap();
    assert_eq!(report.status, OutcomeTag::Success);
    assert_eq!(report.mode, ExecutionMode::Miri);
    assert_eq!(report.stdout, "hi\n");

    let response = server
        .post("/execute", json!({"code": "echo boom >&2; exit 101", "mode": "run"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let report: ExecutionReport = response.json().await.unwrap();
    assert_eq!(report.status, OutcomeTag::RuntimeFailure);
    assert_eq!(report.mode, ExecutionMode::Run);
    assert_eq!(report.exit_code, Some(101));

    let response = server
        .post("/execute", json!({"code": "sleep 30", "timeout_ms": 300}))
        .await;
    let report: ExecutionReport = response.json().await.unwrap();
    assert_eq!(report.status, OutcomeTag::TimedOut);
}

#[tokio::test]
async fn compile_and_format_force_their_mode() {
    let harness = Harness::new();
    let server = Server::start(harness.dispatcher(), None).await;

    let response = server
        .post("/compile", json!({"code": "# COMPILE_ERROR", "mode": "miri"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let report: ExecutionReport = response.json().await.unwrap();
    assert_eq!(report.mode, ExecutionMode::Build);
    assert_eq!(report.status, OutcomeTag::CompileError);
    assert!(report.stderr.contains("mismatched types"));

    let response = server.post("/format", json!({"code": "fn main() {}\n"})).await;
    let report: ExecutionReport = response.json().await.unwrap();
    assert_eq!(report.mode, ExecutionMode::Format);
    assert_eq!(report.stage, Some(Stage::Format));
    assert_eq!(report.stdout, "fn main() {}\n// formatted\n");
}

#[tokio::test]
async fn compile_targets_and_channels_over_http() {
    let harness = Harness::new();
    let server = Server::start(harness.dispatcher(), None).await;

    let response = server
        .post(
            "/compile",
            json!({"code": "echo hi", "target": "llvm-ir", "channel": "nightly"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let report: ExecutionReport = response.json().await.unwrap();
    assert_eq!(report.status, OutcomeTag::Success);
    assert_eq!(report.code.as_deref(), Some("; channel=nightly\necho hi"));

    let response = server
        .post(
            "/execute",
            json!({"code": "echo \"$RUSTUP_TOOLCHAIN\"", "mode": "run", "channel": "beta"}),
        )
        .await;
    let report: ExecutionReport = response.json().await.unwrap();
    assert_eq!(report.stdout, "beta\n");
    assert_eq!(report.code, None);

    for body in [
        json!({"code": "echo hi", "target": "wasm"}),
        json!({"code": "echo hi", "channel": "dev"}),
        json!({"code": "echo hi", "channel": "stable"}),
        json!({"code": "echo hi", "mode": "run", "target": "asm"}),
        json!({"code": "echo hi", "memory_mb": 17_592_186_044_416u64}),
    ] {
        let response = server.post("/execute", body.clone()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
        let error: Value = response.json().await.unwrap();
        assert!(error["error"].is_string());
    }
}

#[tokio::test]
async fn bad_requests_get_a_json_error() {
    let harness = Harness::new();
    let server = Server::start(harness.dispatcher(), None).await;

    let response = server.post("/execute", json!({"code": "   "})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("source is empty"));

    let response = server.post("/execute", json!({"mode": "run"})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let response = server
        .post("/execute", json!({"code": "echo hi", "mode": "asm"}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancellation_over_http() {
    let harness = Harness::new();
    let server = Server::start(harness.dispatcher(), None).await;

    let response = server
        .client
        .delete(server.url("/executions/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let running = server.post("/execute", json!({"code": "sleep 30", "id": "slow"}));
    let cancel = async {
        let state = server.state.clone();
        assert!(eventually(|| state.dispatcher.status().in_flight == 1).await);
        server
            .client
            .delete(server.url("/executions/slow"))
            .send()
            .await
            .unwrap()
    };
    let (running, cancelled) = tokio::join!(running, cancel);
    assert_eq!(cancelled.status(), StatusCode::ACCEPTED);
    let report: ExecutionReport = running.json().await.unwrap();
    assert_eq!(report.id, "slow");
    assert_eq!(report.status, OutcomeTag::Cancelled);
}

#[tokio::test]
async fn duplicates_conflict_and_overload_is_unavailable() {
    let harness = Harness::new();
    let server = Server::start(harness.single_slot(QueuePolicy::Reject), None).await;

    let running = server.post("/execute", json!({"code": "sleep 30", "id": "only"}));
    let others = async {
        let state = server.state.clone();
        assert!(eventually(|| state.dispatcher.status().in_flight == 1).await);

        let duplicate = server
            .post("/execute", json!({"code": "echo hi", "id": "only"}))
            .await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let busy = server.post("/execute", json!({"code": "echo hi"})).await;
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = busy.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("Service busy"));

        assert!(server.state.dispatcher.cancel("only").await);
    };
    let (running, ()) = tokio::join!(running, others);
    assert_eq!(running.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_health_and_static_files() {
    let harness = Harness::new();
    let ui = tempfile::tempdir().unwrap();
    fs::write(ui.path().join("index.html"), "<h1>playground</h1>").unwrap();
    let server = Server::start(harness.dispatcher(), Some(ui.path())).await;

    let health = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.text().await.unwrap(), "OK");

    server.post("/execute", json!({"code": "echo hi"})).await;
    let status: Value = server
        .client
        .get(server.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["capacity"], 10);
    assert_eq!(status["in_flight"], 0);
    assert_eq!(status["completed"], 1);
    assert_eq!(status["formatter"], true);

    let index = server.client.get(server.url("/")).send().await.unwrap();
    assert_eq!(index.status(), StatusCode::OK);
    assert_eq!(index.text().await.unwrap(), "<h1>playground</h1>");

    let missing = server
        .client
        .get(server.url("/nope.js"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
