//! HTTP surface of the engine, consumed by UI, API routes, and agent
//! tooling. No orchestration logic lives here: handlers translate
//! requests into service calls and typed errors into status codes.

pub mod server;
pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::Deserialize;

use crate::errors::{PhaseError, QueueError};
use crate::events::EventBus;
use crate::phases::registry::PhaseDefinition;
use crate::phases::{PhaseProgressionService, PhaseRegistry};
use crate::queue::TaskQueueService;
use crate::resolver::WorkerResolver;
use crate::store::DbHandle;
use crate::store::models::{Priority, TaskSpec, TaskStatus, WorkerRef};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub queue: Arc<TaskQueueService>,
    pub progression: Arc<PhaseProgressionService>,
    pub resolver: Arc<WorkerResolver>,
    pub registry: Arc<PhaseRegistry>,
    pub bus: Arc<EventBus>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTicketRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "empty_object")]
    pub context: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub worker: WorkerRef,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub phase_id: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Deserialize)]
pub struct ForceAdvanceRequest {
    pub target_phase: String,
    pub reason: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let msg = err.to_string();
        match err {
            QueueError::TaskNotFound { .. } => ApiError::NotFound(msg),
            QueueError::UnknownDependency { .. } | QueueError::DependencyCycle { .. } => {
                ApiError::BadRequest(msg)
            }
            // Callers must re-read current state before retrying.
            QueueError::InvalidTransition { .. } | QueueError::RetriesExhausted { .. } => {
                ApiError::Conflict(msg)
            }
            QueueError::Other(_) => ApiError::Internal(msg),
        }
    }
}

impl From<PhaseError> for ApiError {
    fn from(err: PhaseError) -> Self {
        let msg = err.to_string();
        match err {
            PhaseError::TicketNotFound { .. } => ApiError::NotFound(msg),
            PhaseError::UnknownPhase { .. } => ApiError::BadRequest(msg),
            PhaseError::TerminalPhase { .. }
            | PhaseError::AmbiguousTransition { .. }
            | PhaseError::TransitionNotAllowed { .. } => ApiError::Conflict(msg),
            PhaseError::Queue(inner) => inner.into(),
            PhaseError::Other(_) => ApiError::Internal(msg),
        }
    }
}

/// Run a synchronous service call off the async worker threads.
async fn blocking<R, E, F>(f: F) -> Result<R, ApiError>
where
    F: FnOnce() -> Result<R, E> + Send + 'static,
    R: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Worker task panicked: {}", e)))?
        .map_err(Into::into)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/tickets", post(create_ticket))
        .route("/api/tickets/{id}", get(get_ticket))
        .route("/api/tickets/{id}/tasks", get(list_ticket_tasks))
        .route("/api/tickets/{id}/gate", get(get_gate))
        .route("/api/tickets/{id}/advance", post(advance_ticket))
        .route("/api/tickets/{id}/force-advance", post(force_advance_ticket))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/claim", post(claim_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/status", patch(update_task_status))
        .route("/api/tasks/{id}/heartbeat", post(task_heartbeat))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/workers/{worker_ref}/task", get(resolve_worker_task))
        .route("/api/phases", get(list_phases))
        .route("/health", get(health_check))
}

// ── Ticket handlers ───────────────────────────────────────────────────

async fn create_ticket(
    State(state): State<SharedState>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let progression = state.progression.clone();
    let ticket = blocking(move || {
        progression.create_ticket(&req.title, &req.description, req.priority, req.context)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn get_ticket(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let progression = state.progression.clone();
    let ticket = blocking(move || progression.get_ticket(&id)).await?;
    Ok(Json(ticket))
}

async fn list_ticket_tasks(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let queue = state.queue.clone();
    let grouped = blocking(move || queue.list_by_phase(&id)).await?;
    Ok(Json(grouped))
}

async fn get_gate(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let progression = state.progression.clone();
    let evaluation = blocking(move || progression.gate_status(&id)).await?;
    Ok(Json(evaluation))
}

async fn advance_ticket(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let progression = state.progression.clone();
    let outcome = blocking(move || progression.advance(&id)).await?;
    Ok(Json(outcome))
}

async fn force_advance_ticket(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ForceAdvanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let progression = state.progression.clone();
    let ticket =
        blocking(move || progression.force_advance(&id, &req.target_phase, &req.reason)).await?;
    Ok(Json(ticket))
}

// ── Task handlers ─────────────────────────────────────────────────────

async fn create_task(
    State(state): State<SharedState>,
    Json(spec): Json<TaskSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let queue = state.queue.clone();
    let task = blocking(move || queue.create_task(spec)).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn claim_task(
    State(state): State<SharedState>,
    Json(req): Json<ClaimRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let queue = state.queue.clone();
    let claimed = blocking(move || {
        queue.claim_next(&req.worker, &req.capabilities, req.phase_id.as_deref())
    })
    .await?;
    Ok(Json(claimed))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let queue = state.queue.clone();
    let task = blocking(move || queue.get_task(&id)).await?;
    Ok(Json(task))
}

async fn update_task_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let queue = state.queue.clone();
    let task = blocking(move || {
        queue.update_status(&id, req.status, req.result, req.error_message.as_deref())
    })
    .await?;
    Ok(Json(task))
}

async fn task_heartbeat(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let queue = state.queue.clone();
    let recorded = blocking(move || queue.record_heartbeat(&id)).await?;
    Ok(Json(serde_json::json!({ "recorded": recorded })))
}

async fn retry_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let queue = state.queue.clone();
    let task = blocking(move || queue.retry_task(&id)).await?;
    Ok(Json(task))
}

// ── Resolver & registry handlers ──────────────────────────────────────

async fn resolve_worker_task(
    State(state): State<SharedState>,
    Path(worker_ref): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let resolver = state.resolver.clone();
    let task = blocking(move || {
        resolver
            .resolve_current_task(&worker_ref)
            .map_err(|e| ApiError::Internal(e.to_string()))
    })
    .await?;
    Ok(Json(task))
}

async fn list_phases(State(state): State<SharedState>) -> Json<Vec<PhaseDefinition>> {
    Json(state.registry.ordered().into_iter().cloned().collect())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::server::build_state;
    use crate::store::EngineDb;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let db = EngineDb::new_in_memory().unwrap();
        let state = build_state(db, PhaseRegistry::default_pipeline(), None);
        server::build_router(state)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_phases_listing() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/phases")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let phases = body_json(resp).await;
        assert_eq!(phases.as_array().unwrap().len(), 6);
        assert_eq!(phases[0]["id"], "REQUIREMENTS");
    }

    #[tokio::test]
    async fn test_ticket_creation_spawns_tasks() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/tickets",
                serde_json::json!({"title": "Build the thing"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let ticket = body_json(resp).await;
        assert_eq!(ticket["phase_id"], "REQUIREMENTS");

        let uri = format!("/api/tickets/{}/tasks", ticket["id"].as_str().unwrap());
        let resp = app
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let grouped = body_json(resp).await;
        assert_eq!(grouped["REQUIREMENTS"][0]["task_type"], "generate_prd");
    }

    #[tokio::test]
    async fn test_claim_and_status_flow() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/tasks",
                serde_json::json!({"phase_id": "IMPLEMENTATION", "task_type": "implement"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let task = body_json(resp).await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/tasks/claim",
                serde_json::json!({"worker": {"kind": "ephemeral", "id": "sbx-1"}}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let claimed = body_json(resp).await;
        assert_eq!(claimed["id"], task_id.as_str());
        assert_eq!(claimed["status"], "assigned");

        // Illegal transition maps to 409.
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri(format!("/api/tasks/{}/status", task_id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"status": "completed"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri(format!("/api/tasks/{}/status", task_id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"status": "running"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_404() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/tickets/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resolver_endpoint_returns_null_for_unknown() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/workers/nobody/task")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_json(resp).await.is_null());
    }

    #[tokio::test]
    async fn test_force_advance_endpoint() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/tickets",
                serde_json::json!({"title": "Build"}),
            ))
            .await
            .unwrap();
        let ticket = body_json(resp).await;
        let id = ticket["id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/tickets/{}/force-advance", id),
                serde_json::json!({"target_phase": "DONE", "reason": "operator closing out"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let advanced = body_json(resp).await;
        assert_eq!(advanced["phase_id"], "DONE");
        assert_eq!(advanced["status"], "done");

        // Terminal now: further overrides are refused.
        let resp = app
            .oneshot(post_json(
                &format!("/api/tickets/{}/force-advance", id),
                serde_json::json!({"target_phase": "DESIGN", "reason": "no"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
