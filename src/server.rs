//! HTTP API for the pipeline.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Ingest a batch of signals |
//! | `GET`  | `/signals` | List signals (`product`, `limit`) |
//! | `GET`  | `/topics`, `/topics/{id}` | Topics |
//! | `GET`  | `/tasks`, `/tasks/{id}` | Tasks (`status`, `category`, `limit`) |
//! | `PATCH` | `/tasks/{id}` | Explicit task status transition |
//! | `POST` | `/tasks/{id}/create-issue` | Create a forge issue |
//! | `POST` | `/tasks/{id}/fix` | Run the fix pipeline (at-most-once guard) |
//! | `GET/POST` | `/products/{product}/rules` | List / create rules |
//! | `DELETE` | `/products/{product}/rules/{id}` | Delete a rule |
//! | `POST` | `/webhooks/forge` | Signed forge webhook |
//! | `GET`  | `/health` | Liveness + store connectivity |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "a fix is already running" } }
//! ```
//!
//! Codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `conflict` (409), `provider_error` (502), `internal` (500). Provider
//! error details are logged, never echoed to clients.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::fix::FixOutcome;
use crate::ingest::BatchResult;
use crate::models::{
    now_epoch, task_key, topic_key, Rule, RuleCategory, RuleSource, Signal, SignalIn, Task,
    TaskStatus, Topic,
};
use crate::review::{parse_event, verify_signature, ReviewAction};

type AppState = Arc<AppContext>;

/// Bind and serve until the process is terminated.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    info!(bind = %bind_addr, "darwin API listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Route table, separated from [`run_server`] so tests can drive it.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/signals", get(handle_list_signals))
        .route("/topics", get(handle_list_topics))
        .route("/topics/{id}", get(handle_get_topic))
        .route("/tasks", get(handle_list_tasks))
        .route("/tasks/{id}", get(handle_get_task).patch(handle_patch_task))
        .route("/tasks/{id}/create-issue", post(handle_create_issue))
        .route("/tasks/{id}/fix", post(handle_fix))
        .route(
            "/products/{product}/rules",
            get(handle_list_rules).post(handle_create_rule),
        )
        .route("/products/{product}/rules/{id}", delete(handle_delete_rule))
        .route("/webhooks/forge", post(handle_webhook))
        .route("/health", get(handle_health))
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict",
        message: message.into(),
    }
}

/// Provider failure: log the detail, return a generic body.
fn provider_error(detail: &anyhow::Error) -> AppError {
    error!(error = %detail, "external provider failure");
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "provider_error",
        message: "external provider request failed".to_string(),
    }
}

fn internal_error(detail: &anyhow::Error) -> AppError {
    error!(error = %detail, "internal error");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: "internal error".to_string(),
    }
}

// ============ POST /ingest ============

async fn handle_ingest(
    State(state): State<AppState>,
    Json(signals): Json<Vec<SignalIn>>,
) -> Result<Json<BatchResult>, AppError> {
    if signals.is_empty() {
        return Err(bad_request("signal batch must not be empty"));
    }
    Ok(Json(state.ingest.ingest_batch(signals).await))
}

// ============ GET /signals ============

#[derive(Deserialize)]
struct ListQuery {
    product: Option<String>,
    status: Option<String>,
    category: Option<String>,
    limit: Option<usize>,
}

const DEFAULT_LIST_LIMIT: usize = 50;

async fn handle_list_signals(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Signal>>, AppError> {
    let records = state
        .store
        .scan_records("signal:")
        .await
        .map_err(|e| internal_error(&e))?;

    let mut signals = Vec::new();
    for (_, fields) in records {
        let signal = Signal::from_fields(&fields).map_err(|e| internal_error(&e))?;
        if let Some(product) = &query.product {
            if &signal.product != product {
                continue;
            }
        }
        signals.push(signal);
    }
    signals.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.hash.cmp(&b.hash)));
    signals.truncate(query.limit.unwrap_or(DEFAULT_LIST_LIMIT));
    Ok(Json(signals))
}

// ============ GET /topics, /topics/{id} ============

async fn handle_list_topics(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Topic>>, AppError> {
    let records = state
        .store
        .scan_records("topic:")
        .await
        .map_err(|e| internal_error(&e))?;

    let mut topics = Vec::new();
    for (_, fields) in records {
        let topic = Topic::from_fields(&fields).map_err(|e| internal_error(&e))?;
        if let Some(product) = &query.product {
            if &topic.product != product {
                continue;
            }
        }
        topics.push(topic);
    }
    topics.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
    topics.truncate(query.limit.unwrap_or(DEFAULT_LIST_LIMIT));
    Ok(Json(topics))
}

async fn handle_get_topic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Topic>, AppError> {
    let fields = state
        .store
        .get_record(&topic_key(&id))
        .await
        .map_err(|e| internal_error(&e))?
        .ok_or_else(|| not_found(format!("topic {} not found", id)))?;
    let topic = Topic::from_fields(&fields).map_err(|e| internal_error(&e))?;
    Ok(Json(topic))
}

// ============ GET /tasks, /tasks/{id} ============

async fn handle_list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let status_filter = query
        .status
        .as_deref()
        .map(TaskStatus::parse)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;
    let category_filter = query
        .category
        .as_deref()
        .map(crate::models::TaskCategory::parse)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;

    let records = state
        .store
        .scan_records("task:")
        .await
        .map_err(|e| internal_error(&e))?;

    let mut tasks = Vec::new();
    for (_, fields) in records {
        let task = Task::from_fields(&fields).map_err(|e| internal_error(&e))?;
        if let Some(status) = status_filter {
            if task.status != status {
                continue;
            }
        }
        if let Some(category) = category_filter {
            if task.category != category {
                continue;
            }
        }
        tasks.push(task);
    }
    tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
    tasks.truncate(query.limit.unwrap_or(DEFAULT_LIST_LIMIT));
    Ok(Json(tasks))
}

async fn load_task(state: &AppState, id: &str) -> Result<Task, AppError> {
    let fields = state
        .store
        .get_record(&task_key(id))
        .await
        .map_err(|e| internal_error(&e))?
        .ok_or_else(|| not_found(format!("task {} not found", id)))?;
    Task::from_fields(&fields).map_err(|e| internal_error(&e))
}

async fn handle_get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(load_task(&state, &id).await?))
}

// ============ PATCH /tasks/{id} ============

#[derive(Deserialize)]
struct PatchTaskBody {
    status: String,
}

async fn handle_patch_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchTaskBody>,
) -> Result<Json<Task>, AppError> {
    let status = TaskStatus::parse(&body.status).map_err(|e| bad_request(e.to_string()))?;
    let mut task = load_task(&state, &id).await?;

    task.status = status;
    task.updated_at = now_epoch();
    state
        .store
        .put_record(&task_key(&id), &task.to_fields())
        .await
        .map_err(|e| internal_error(&e))?;
    Ok(Json(task))
}

// ============ POST /tasks/{id}/create-issue ============

async fn handle_create_issue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task = load_task(&state, &id).await?;
    let repo = state
        .config
        .repo_for_product(&task.product)
        .ok_or_else(|| {
            bad_request(format!("no repository mapped for product '{}'", task.product))
        })?
        .to_string();

    let body = issue_body(&task);
    let issue = state
        .forge
        .create_issue(&repo, &task.title, &body)
        .await
        .map_err(|e| provider_error(&e))?;

    state
        .store
        .set_field(&task_key(&id), "issue_url", &issue.issue_url)
        .await
        .map_err(|e| internal_error(&e))?;
    state
        .store
        .set_field(&task_key(&id), "issue_number", &issue.issue_number.to_string())
        .await
        .map_err(|e| internal_error(&e))?;

    Ok(Json(serde_json::json!({
        "issue_url": issue.issue_url,
        "issue_number": issue.issue_number,
    })))
}

fn issue_body(task: &Task) -> String {
    format!(
        "{}\n\n**Severity:** {}\n**Suggested action:** {}\n\n---\n*Filed automatically from clustered user feedback (topic {}).*",
        task.summary, task.severity, task.suggested_action, task.topic_id,
    )
}

// ============ POST /tasks/{id}/fix ============

#[derive(Serialize)]
struct FixResponse {
    fix_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files_changed: Option<Vec<String>>,
}

async fn handle_fix(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FixResponse>, AppError> {
    let outcome = state
        .fix_runner
        .run(&id, None)
        .await
        .map_err(|e| internal_error(&e))?;

    match outcome {
        FixOutcome::Completed {
            pr_url,
            branch,
            files_changed,
        } => Ok(Json(FixResponse {
            fix_status: "completed".to_string(),
            pr_url: Some(pr_url),
            branch: Some(branch),
            files_changed: Some(files_changed),
        })),
        FixOutcome::Failed { .. } => Ok(Json(FixResponse {
            fix_status: "failed".to_string(),
            pr_url: None,
            branch: None,
            files_changed: None,
        })),
        FixOutcome::Conflict { fix_status } => Err(conflict(format!(
            "fix already {} for this task",
            fix_status.as_str()
        ))),
    }
}

// ============ Rules ============

async fn handle_list_rules(
    State(state): State<AppState>,
    Path(product): Path<String>,
) -> Result<Json<Vec<Rule>>, AppError> {
    let rules = state
        .learning
        .list_rules(&product)
        .await
        .map_err(|e| internal_error(&e))?;
    Ok(Json(rules))
}

#[derive(Deserialize)]
struct CreateRuleBody {
    content: String,
    category: String,
}

async fn handle_create_rule(
    State(state): State<AppState>,
    Path(product): Path<String>,
    Json(body): Json<CreateRuleBody>,
) -> Result<Json<Rule>, AppError> {
    let category =
        RuleCategory::parse(&body.category).map_err(|e| bad_request(e.to_string()))?;
    let rule = state
        .learning
        .upsert_rule(&product, &body.content, category, RuleSource::Manual, None, None)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(rule))
}

async fn handle_delete_rule(
    State(state): State<AppState>,
    Path((product, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = state
        .learning
        .delete_rule(&product, &id)
        .await
        .map_err(|e| internal_error(&e))?;
    if !deleted {
        return Err(not_found(format!("rule {} not found", id)));
    }
    Ok(Json(serde_json::json!({})))
}

// ============ POST /webhooks/forge ============

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let secret = state.config.webhook_secret();
    if secret.is_empty() {
        warn!("webhook received but no secret is configured");
        return Err(unauthorized("webhook secret not configured"));
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&secret, &body, signature) {
        return Err(unauthorized("invalid webhook signature"));
    }

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| bad_request("webhook body is not JSON"))?;
    let event = match parse_event(&payload) {
        Some(event) => event,
        None => return Ok(Json(serde_json::json!({}))),
    };

    let action = state
        .review
        .handle_event(event)
        .await
        .map_err(|e| internal_error(&e))?;

    if let ReviewAction::Reiterate { task_id, feedback } = action {
        let runner = state.fix_runner.clone();
        tokio::spawn(async move {
            info!(task_id = %task_id, "auto-iterate fix run starting from review feedback");
            if let Err(e) = runner.run(&task_id, Some(&feedback)).await {
                warn!(task_id = %task_id, error = %e, "auto-iterate fix run errored");
            }
        });
    }

    Ok(Json(serde_json::json!({})))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    store_ok: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_ok = state.store.ping().await.is_ok();
    Json(HealthResponse { ok: true, store_ok })
}
