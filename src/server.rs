//! HTTP front end for the dispatcher.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/{client}` | Form with `step` plus step/option fields |
//! | `GET`  | `/{client}/{task_id}` | Task status: 404, 202 pending, 200 done (then deleted) |
//! | `POST` | `/admin/reload/{client}` | Re-read one client's `config.json` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": "Invalid step: summarize", "code": "invalid_step" }
//! ```
//!
//! # Deferred execution
//!
//! An accepted async step answers 202 with a streamed body. The body owns a
//! [`FlushSignal`]; when hyper drops the body after writing it, the signal
//! fires and the captured [`DeferredStep`](crate::dispatch::DeferredStep)
//! starts. The step therefore never delays the acknowledgement.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::client::ClientRegistry;
use crate::config::Config;
use crate::dispatch::{DispatchError, Dispatched, Dispatcher};
use crate::tasks::{TaskRegistry, TaskStatus};
use crate::workflow::WorkflowCatalog;

/// Starts the dispatcher on `[server].bind` with file-backed tasks and every
/// client found under `[clients].root`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let tasks = TaskRegistry::file_backed(&config.server.tasks_dir).with_context(|| {
        format!(
            "Failed to open task directory {}",
            config.server.tasks_dir.display()
        )
    })?;
    let clients = ClientRegistry::load_all(config, WorkflowCatalog::with_builtins())?;
    let names = clients.names();
    if names.is_empty() {
        warn!(root = %config.clients.root.display(), "No clients configured");
    }
    for name in &names {
        info!("  POST /{}", name);
    }

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(addr = %listener.local_addr()?, clients = names.len(), "Dispatcher listening");

    serve(listener, Dispatcher::new(Arc::new(clients), tasks)).await
}

/// Serves `dispatcher` on an already bound listener.
pub async fn serve(listener: TcpListener, dispatcher: Dispatcher) -> anyhow::Result<()> {
    axum::serve(listener, router(dispatcher)).await?;
    Ok(())
}

pub fn router(dispatcher: Dispatcher) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/admin/reload/{client}", post(handle_reload))
        .route("/{client}", post(handle_invoke))
        .route("/{client}/{task_id}", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(dispatcher)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

/// Error that converts into a JSON HTTP response.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::UnknownClient(_) => StatusCode::NOT_FOUND,
            DispatchError::MissingStep | DispatchError::UnknownStep(_) => StatusCode::BAD_REQUEST,
            DispatchError::Task(_) | DispatchError::Step(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %err, "Request failed");
        }
        AppError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /{client} ============

/// Fires its channel when dropped.
struct FlushSignal(Option<oneshot::Sender<()>>);

impl Drop for FlushSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// A JSON body that fires `signal` once hyper is done with it.
fn body_with_signal(value: &Value, signal: FlushSignal) -> Result<Body, AppError> {
    let bytes = Bytes::from(serde_json::to_vec(value).map_err(|e| internal(e.to_string()))?);
    let chunks = stream::iter([Ok::<_, Infallible>(bytes)]).map(move |chunk| {
        let _held = &signal;
        chunk
    });
    Ok(Body::from_stream(chunks))
}

async fn handle_invoke(
    State(dispatcher): State<Dispatcher>,
    Path(client): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Response, AppError> {
    match dispatcher.dispatch(&client, &form).await? {
        Dispatched::Completed(result) => Ok((StatusCode::OK, Json(result)).into_response()),
        Dispatched::Accepted { ack, deferred } => {
            let (tx, rx) = oneshot::channel();
            let body = body_with_signal(&ack, FlushSignal(Some(tx)))?;
            deferred.spawn_after(rx);
            Ok((
                StatusCode::ACCEPTED,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response())
        }
    }
}

// ============ GET /{client}/{task_id} ============

async fn handle_status(
    State(dispatcher): State<Dispatcher>,
    Path((client, task_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    if dispatcher.clients.get(&client).is_none() {
        return Err(DispatchError::UnknownClient(client).into());
    }
    let status = dispatcher
        .tasks
        .get_status(&task_id)
        .await
        .map_err(|e| internal(e.to_string()))?;
    match status {
        TaskStatus::Pending(record) => Ok((StatusCode::ACCEPTED, Json(record)).into_response()),
        TaskStatus::Done(record) => Ok((StatusCode::OK, Json(record)).into_response()),
        TaskStatus::NotFound => Err(not_found(format!("No such task: {}", task_id))),
    }
}

// ============ POST /admin/reload/{client} ============

async fn handle_reload(
    State(dispatcher): State<Dispatcher>,
    Path(client): Path<String>,
) -> Result<Json<Value>, AppError> {
    let reloaded = dispatcher.clients.reload(&client).map_err(|e| AppError {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        code: "reload_failed",
        message: format!("{e:#}"),
    })?;
    let steps: Vec<&String> = reloaded.config.steps.keys().collect();
    Ok(Json(json!({
        "client": reloaded.name,
        "workflow": reloaded.workflow.name(),
        "steps": steps,
    })))
}
