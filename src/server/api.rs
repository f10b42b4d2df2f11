use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{ControlSignal, Orchestrator, RecoveryError, RegistryError, RunRequest};
use crate::domain::{EventType, LogSeq, StreamEvent, StreamFrame};
use crate::stream::{GatewayError, HealthStatus, LagMonitor, StartFrom, StoreError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub monitor: LagMonitor,
    /// Flips to true on shutdown; open SSE responses send `stream_end` and close
    pub shutdown: watch::Receiver<bool>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "fromId")]
    pub from_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub count: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct GroupReadQuery {
    pub consumer: String,
    pub count: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub seqs: Vec<LogSeq>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Disabled => ApiError::Unavailable(err.to_string()),
            GatewayError::Store(StoreError::NoSuchGroup { .. }) => ApiError::NotFound(err.to_string()),
            GatewayError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyActive(_) => ApiError::Conflict(err.to_string()),
            RegistryError::NotFound(_) => ApiError::NotFound(err.to_string()),
        }
    }
}

/// Map orchestration failures: known seam errors keep their status,
/// anything else is a bad request.
fn run_error(err: anyhow::Error) -> ApiError {
    let message = format!("{:#}", err);
    if let Some(registry) = err.downcast_ref::<RegistryError>() {
        return match registry {
            RegistryError::AlreadyActive(_) => ApiError::Conflict(message),
            RegistryError::NotFound(_) => ApiError::NotFound(message),
        };
    }
    if let Some(RecoveryError::NotFound(_)) = err.downcast_ref::<RecoveryError>() {
        return ApiError::NotFound(message);
    }
    ApiError::BadRequest(message)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{run_id}/events", get(stream_events))
        .route("/runs/{run_id}/events/history", get(event_history))
        .route("/runs/{run_id}/status", get(run_status))
        .route("/runs/{run_id}/pause", post(pause_run))
        .route("/runs/{run_id}/resume", post(resume_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/{run_id}/recovery", get(recovery_info))
        .route("/runs/{run_id}/recover", post(recover_run))
        .route("/events/health", get(events_health))
        .route("/events/lag", get(events_lag))
        .route("/events/groups/{group}/read", post(read_group))
        .route("/events/groups/{group}/ack", post(ack_group))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Resume offset from `fromId` or the `Last-Event-ID` header, query first.
/// Offsets are log sequences; absent means "latest".
pub fn parse_offset(query: Option<&str>, headers: &HeaderMap) -> Result<StartFrom, ApiError> {
    let header = headers
        .get("last-event-id")
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::BadRequest("Last-Event-ID is not valid text".to_string()))
        })
        .transpose()?;

    match query.or(header).map(str::trim) {
        None | Some("") | Some("latest") => Ok(StartFrom::Latest),
        Some(raw) => raw
            .parse::<u64>()
            .map(|seq| StartFrom::After(LogSeq(seq)))
            .map_err(|_| ApiError::BadRequest(format!("Invalid event offset '{}'", raw))),
    }
}

/// SSE frame: `id` is the log sequence when present, `event` the type
fn sse_event(event: &StreamEvent) -> Result<Event, axum::Error> {
    let frame = Event::default()
        .event(event.event_type.as_str())
        .json_data(event.to_frame())?;
    Ok(match event.log_seq {
        Some(seq) => frame.id(seq.to_string()),
        None => frame,
    })
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn stream_events(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let from = parse_offset(query.from_id.as_deref(), &headers)?;
    let events = state
        .orchestrator
        .gateway()
        .subscribe(run_id, from)
        .await?;

    info!(%run_id, ?from, "SSE subscription opened");

    let mut shutdown = state.shutdown.clone();
    let frames = async_stream::stream! {
        let mut events = events;
        let stopped = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        tokio::pin!(stopped);

        loop {
            let next = tokio::select! {
                event = events.next() => Some(event),
                () = &mut stopped => None,
            };
            match next {
                Some(Some(event)) => {
                    yield sse_event(&event);
                }
                Some(None) => return,
                None => {
                    info!(%run_id, "Closing SSE subscription for shutdown");
                    let end = StreamEvent::new(run_id, EventType::StreamEnd, json!({ "reason": "shutdown" }));
                    yield sse_event(&end);
                    return;
                }
            }
        }
    };

    Ok(Sse::new(frames))
}

async fn event_history(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let gateway = state.orchestrator.gateway();
    let count = query.count.unwrap_or(gateway.settings().history_limit);

    let events: Vec<StreamFrame> = if gateway.is_enabled() {
        gateway
            .get_history(run_id, count)
            .await?
            .iter()
            .map(StreamEvent::to_frame)
            .collect()
    } else {
        Vec::new()
    };

    Ok(Json(json!({
        "runId": run_id,
        "count": events.len(),
        "events": events,
    })))
}

async fn events_health(State(state): State<SharedState>) -> Response {
    let health = state.orchestrator.gateway().health().await;
    let status = match health.status {
        HealthStatus::Ok | HealthStatus::Disabled => StatusCode::OK,
        HealthStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health)).into_response()
}

async fn events_lag(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let report = state.monitor.report().await?;
    Ok(Json(report).into_response())
}

/// Deliver the next global-log events to a consumer of `group`
async fn read_group(
    State(state): State<SharedState>,
    Path(group): Path<String>,
    Query(query): Query<GroupReadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = query.count.unwrap_or(100);
    let events: Vec<StreamFrame> = state
        .monitor
        .read(&group, &query.consumer, count)
        .await?
        .iter()
        .map(StreamEvent::to_frame)
        .collect();

    Ok(Json(json!({
        "group": group,
        "consumer": query.consumer,
        "count": events.len(),
        "events": events,
    })))
}

async fn ack_group(
    State(state): State<SharedState>,
    Path(group): Path<String>,
    Json(request): Json<AckRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let acked = state.monitor.ack(&group, &request.seqs).await?;
    Ok(Json(json!({ "group": group, "acked": acked })))
}

async fn list_runs(State(state): State<SharedState>) -> Response {
    let runs = state.orchestrator.registry().list().await;
    Json(runs).into_response()
}

async fn start_run(
    State(state): State<SharedState>,
    Json(request): Json<RunRequest>,
) -> Result<Response, ApiError> {
    let started = state.orchestrator.start(request).await.map_err(run_error)?;
    let run_id = started.handle.run_id;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "runId": run_id,
            "events": format!("/runs/{}/events", run_id),
        })),
    )
        .into_response())
}

async fn run_status(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match state.orchestrator.status(run_id).await {
        Ok(Some(status)) => Ok(Json(status).into_response()),
        Ok(None) => Err(ApiError::NotFound(format!("Run {} not found", run_id))),
        Err(e) => Err(ApiError::Internal(format!("{:#}", e))),
    }
}

async fn control_run(
    state: &SharedState,
    run_id: Uuid,
    apply: impl FnOnce(&crate::core::RunControl) -> bool,
) -> Result<Response, ApiError> {
    let control = state.orchestrator.registry().control(run_id).await?;
    let changed = apply(control.as_ref());
    let signal: ControlSignal = control.signal();
    Ok(Json(json!({
        "runId": run_id,
        "signal": signal,
        "changed": changed,
    }))
    .into_response())
}

async fn pause_run(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    control_run(&state, run_id, |c| c.pause()).await
}

async fn resume_run(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    control_run(&state, run_id, |c| c.resume()).await
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    control_run(&state, run_id, |c| c.cancel()).await
}

async fn recovery_info(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match state.orchestrator.recovery().info(run_id) {
        Ok(info) => Ok(Json(info).into_response()),
        Err(RecoveryError::NotFound(_)) => Err(ApiError::NotFound(format!(
            "No snapshot for run {}",
            run_id
        ))),
        Err(e) => {
            warn!(%run_id, error = %e, "Snapshot unreadable");
            Err(ApiError::Internal(e.to_string()))
        }
    }
}

async fn recover_run(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let started = state.orchestrator.resume(run_id).await.map_err(run_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"runId": started.handle.run_id, "resumed": true})),
    )
        .into_response())
}
