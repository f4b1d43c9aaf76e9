use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use proto_harness::client::{Client, ClientConfig, ClientRegistry};
use proto_harness::dispatch::Dispatcher;
use proto_harness::server;
use proto_harness::tasks::store::InMemoryTaskStore;
use proto_harness::tasks::{TaskRegistry, TaskStatus};
use proto_harness::workflow::{Step, StepInput, Workflow};

/// Reports its resolved inputs after the gate opens.
struct Rephrase {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Step for Rephrase {
    fn name(&self) -> &str {
        "rephrase"
    }
    async fn run(&self, input: StepInput) -> Result<Value> {
        let _permit = self.gate.acquire().await?;
        Ok(json!({
            "input": input.param("input"),
            "tone": input.param("tone"),
            "with_translation": input.flag("with_translation"),
        }))
    }
}

struct Fails;

#[async_trait]
impl Step for Fails {
    fn name(&self) -> &str {
        "fails"
    }
    async fn run(&self, _input: StepInput) -> Result<Value> {
        anyhow::bail!("LLM reply has no 'response' field")
    }
}

struct Lookup;

#[async_trait]
impl Step for Lookup {
    fn name(&self) -> &str {
        "lookup"
    }
    async fn run(&self, input: StepInput) -> Result<Value> {
        Ok(json!({ "matches": [input.param("query")] }))
    }
}

struct TestServer {
    base: String,
    tasks: TaskRegistry,
    store: Arc<InMemoryTaskStore>,
    gate: Arc<Semaphore>,
    http: reqwest::Client,
}

async fn start() -> TestServer {
    let gate = Arc::new(Semaphore::new(0));
    let config: ClientConfig = serde_json::from_value(json!({
        "steps": {
            "rephrase": {"input": ["input", "tone"]},
            "fails": {"input": []},
            "lookup": {"input": ["query"], "mode": "sync"},
        },
        "options": {"with_translation": false},
    }))
    .unwrap();
    let workflow = Workflow::new("demo")
        .with_step(Arc::new(Rephrase { gate: gate.clone() }))
        .with_step(Arc::new(Fails))
        .with_step(Arc::new(Lookup));

    let clients = ClientRegistry::new();
    clients.insert(Client::new("demo", config, Arc::new(workflow)).unwrap());
    let store = Arc::new(InMemoryTaskStore::new());
    let tasks = TaskRegistry::new(store.clone());
    let dispatcher = Dispatcher::new(Arc::new(clients), tasks.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, dispatcher));

    TestServer {
        base: format!("http://{}", addr),
        tasks,
        store,
        gate,
        http: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn post(&self, client: &str, form: &[(&str, &str)]) -> (StatusCode, Value) {
        let resp = self
            .http
            .post(format!("{}/{}", self.base, client))
            .form(form)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn status(&self, task_id: &str) -> (StatusCode, Value) {
        let resp = self
            .http
            .get(format!("{}/demo/{}", self.base, task_id))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    /// Polls until the task is no longer pending.
    async fn wait_done(&self, task_id: &str) -> (StatusCode, Value) {
        for _ in 0..200 {
            let (status, body) = self.status(task_id).await;
            if status != StatusCode::ACCEPTED {
                return (status, body);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never completed", task_id);
    }
}

#[tokio::test]
async fn health_reports_version() {
    let srv = start().await;
    let body: Value = reqwest::get(format!("{}/health", srv.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn async_step_pending_then_done_once_then_gone() {
    let srv = start().await;

    let (status, ack) = srv.post("demo", &[("step", "rephrase"), ("input", "Nothing works")]).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = ack["task_id"].as_str().unwrap().to_string();
    assert!(ack["message"].is_string());
    assert!(ack["started"].is_string());

    // The step is still gated, so the acknowledgement did not wait for it.
    let (status, pending) = srv.status(&task_id).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(pending["done"], false);
    assert_eq!(pending["task_id"], task_id.as_str());

    srv.gate.add_permits(1);
    let (status, done) = srv.wait_done(&task_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["done"], true);
    assert_eq!(done["started"], ack["started"]);
    assert_eq!(done["input"], "Nothing works");
    assert_eq!(done["tone"], Value::Null);

    let (status, _) = srv.status(&task_id).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn option_defaults_and_string_booleans() {
    let srv = start().await;
    srv.gate.add_permits(2);

    let (_, ack) = srv.post("demo", &[("step", "rephrase"), ("input", "a")]).await;
    let (_, done) = srv.wait_done(ack["task_id"].as_str().unwrap()).await;
    assert_eq!(done["with_translation"], false);

    let (_, ack) = srv
        .post(
            "demo",
            &[("step", "rephrase"), ("input", "a"), ("with_translation", "true")],
        )
        .await;
    let (_, done) = srv.wait_done(ack["task_id"].as_str().unwrap()).await;
    assert_eq!(done["with_translation"], true);
}

#[tokio::test]
async fn unknown_step_is_400_without_task() {
    let srv = start().await;

    let (status, body) = srv.post("demo", &[("step", "summarize")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid step: summarize");
    assert_eq!(body["code"], "invalid_step");

    let (status, body) = srv.post("demo", &[("input", "no step")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "missing_step");

    let (status, _) = srv.post("nobody", &[("step", "rephrase")]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(srv.store.is_empty());

    // The same server does record accepted work.
    let (status, ack) = srv.post("demo", &[("step", "rephrase")]).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(srv.store.len(), 1);
    let task_id = ack["task_id"].as_str().unwrap();
    assert!(matches!(
        srv.tasks.get_status(task_id).await.unwrap(),
        TaskStatus::Pending(_)
    ));
    srv.gate.add_permits(1);
    srv.wait_done(task_id).await;
}

#[tokio::test]
async fn failing_step_completes_with_error() {
    let srv = start().await;
    let (status, ack) = srv.post("demo", &[("step", "fails")]).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, done) = srv.wait_done(ack["task_id"].as_str().unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["done"], true);
    assert!(done["error"].as_str().unwrap().contains("response"));
}

#[tokio::test]
async fn sync_step_returns_200_result() {
    let srv = start().await;
    let (status, body) = srv.post("demo", &[("step", "lookup"), ("query", "dns")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"matches": ["dns"]}));
}

#[tokio::test]
async fn unknown_client_and_task_are_404() {
    let srv = start().await;
    let (status, body) = srv.post("nobody", &[("step", "rephrase")]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_client");

    let (status, body) = srv.status("0123456789abcdef").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn reload_without_directory_is_rejected() {
    let srv = start().await;
    let resp = srv
        .http
        .post(format!("{}/admin/reload/demo", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn reload_rejects_reserved_and_path_like_names() {
    let srv = start().await;
    for name in ["..%2Fdemo", "health"] {
        let resp = srv
            .http
            .post(format!("{}/admin/reload/{}", srv.base, name))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "reload_failed");
        assert!(
            body["error"].as_str().unwrap().to_lowercase().contains("client name"),
            "{}",
            body
        );
    }
}
