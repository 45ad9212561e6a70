use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    cache::ResultCache,
    command::ScanRequest,
    config::AppConfig,
    db::FindingFilter,
    error::{Result, ScanError},
    executor::JobExecutor,
    models::{FindingStatus, MonitoredTarget, NotificationSettings, ScanJob, ToolSettings},
    scheduler::{Scheduler, SchedulerStatus},
    security::validate_target,
    settings::{
        load_notification_settings, load_tool_settings, NotificationSettingsPatch, SchedulerSettingsPatch,
        ToolSettingsPatch,
    },
    stream::{tail_log, LogEvent},
};

const READ_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub executor: JobExecutor,
    pub scheduler: Scheduler,
    pub cache: Arc<ResultCache>,
    pub config: Arc<AppConfig>,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/targets", get(list_targets).post(add_target))
        .route("/api/targets/{id}", axum::routing::delete(delete_target))
        .route("/api/targets/{id}/scheduler", post(toggle_target))
        .route("/api/targets/{id}/tool", post(toggle_tool))
        .route("/api/scheduler", get(scheduler_status).post(update_scheduler))
        .route("/api/scheduler/trigger", post(trigger_run))
        .route("/api/tool-settings", get(get_tool_settings).put(update_tool_settings))
        .route("/api/notify-settings", get(get_notify_settings).put(update_notify_settings))
        .route("/api/scans", get(list_scans).post(start_scan))
        .route("/api/scans/{id}", get(get_scan).delete(stop_scan))
        .route("/api/scans/{id}/log", get(scan_log))
        .route("/api/stream/{id}", get(stream_log))
        .route("/api/findings", get(list_findings))
        .route("/api/findings/import", post(import_findings))
        .route("/api/findings/{id}", axum::routing::patch(update_finding))
        .route("/api/findings/{id}/rescan", post(rescan_finding))
        .with_state(state)
}

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        let status = match &self {
            ScanError::Validation(_) => StatusCode::BAD_REQUEST,
            ScanError::NotFound(_) => StatusCode::NOT_FOUND,
            ScanError::AlreadyRunning(_) => StatusCode::CONFLICT,
            ScanError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ScanError::Process(_) => StatusCode::BAD_GATEWAY,
            ScanError::Storage(_) | ScanError::Artifact(_) | ScanError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self, kind = self.kind(), "request failed");
        }
        (status, Json(json!({ "error": self.to_string(), "kind": self.kind() }))).into_response()
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "scanwarden"}))
}

#[derive(Debug, Deserialize)]
pub struct AddTargetRequest {
    address: String,
}

async fn list_targets(State(state): State<AppState>) -> Result<Json<Vec<MonitoredTarget>>> {
    Ok(Json(state.executor.db().list_targets().await?))
}

async fn add_target(
    State(state): State<AppState>,
    Json(req): Json<AddTargetRequest>,
) -> Result<(StatusCode, Json<MonitoredTarget>)> {
    let address = validate_target(&req.address, &state.config.scope_allowlist)?;
    let target = state.executor.db().add_target(&address).await?;
    info!(target = %target.address, "target added");
    Ok((StatusCode::CREATED, Json(target)))
}

async fn delete_target(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode> {
    state.executor.db().delete_target(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    enabled: bool,
}

async fn toggle_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<MonitoredTarget>> {
    state.scheduler.toggle_target(id, req.enabled).await?;
    Ok(Json(state.executor.db().target(id).await?))
}

async fn toggle_tool(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<MonitoredTarget>> {
    state.scheduler.toggle_tool_for_target(id, req.enabled).await?;
    Ok(Json(state.executor.db().target(id).await?))
}

async fn scheduler_status(State(state): State<AppState>) -> Result<Json<SchedulerStatus>> {
    Ok(Json(state.scheduler.status(Utc::now()).await?))
}

async fn update_scheduler(
    State(state): State<AppState>,
    Json(patch): Json<SchedulerSettingsPatch>,
) -> Result<Json<SchedulerStatus>> {
    state.scheduler.update_settings(&patch).await?;
    Ok(Json(state.scheduler.status(Utc::now()).await?))
}

async fn trigger_run(State(state): State<AppState>) -> Result<(StatusCode, Json<Value>)> {
    // the batch outlives the request
    drop(state.scheduler.trigger_manual_run().await?);
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "dispatched"}))))
}

async fn get_tool_settings(State(state): State<AppState>) -> Result<Json<ToolSettings>> {
    Ok(Json(load_tool_settings(state.executor.db()).await?))
}

async fn update_tool_settings(
    State(state): State<AppState>,
    Json(patch): Json<ToolSettingsPatch>,
) -> Result<Json<ToolSettings>> {
    let settings = patch.apply(state.executor.db()).await?;
    info!("tool settings updated");
    Ok(Json(settings))
}

/// Notification settings with the token redacted.
#[derive(Debug, Serialize)]
pub struct NotifySettingsView {
    enabled: bool,
    telegram_token_configured: bool,
    telegram_chat_id: Option<String>,
}

impl From<NotificationSettings> for NotifySettingsView {
    fn from(s: NotificationSettings) -> Self {
        Self {
            enabled: s.enabled,
            telegram_token_configured: s.telegram_token.is_some(),
            telegram_chat_id: s.telegram_chat_id,
        }
    }
}

async fn get_notify_settings(State(state): State<AppState>) -> Result<Json<NotifySettingsView>> {
    Ok(Json(load_notification_settings(state.executor.db()).await?.into()))
}

async fn update_notify_settings(
    State(state): State<AppState>,
    Json(patch): Json<NotificationSettingsPatch>,
) -> Result<Json<NotifySettingsView>> {
    Ok(Json(patch.apply(state.executor.db()).await?.into()))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<i64>,
}

async fn list_scans(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Result<Json<Value>> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    let db = state.executor.db().clone();
    let rows = state
        .cache
        .get_or_fetch(&format!("scans:recent:{limit}"), READ_TTL, || async move {
            Ok::<_, ScanError>(serde_json::to_value(db.list_jobs(limit).await?)?)
        })
        .await?;
    Ok(Json(rows))
}

async fn start_scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let job_id = state.executor.spawn_scan(req).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"job_id": job_id, "status": "queued"}))))
}

async fn get_scan(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ScanJob>> {
    Ok(Json(state.executor.db().job(&id).await?))
}

async fn stop_scan(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let status = state.executor.stop(&id).await?;
    Ok(Json(json!({"job_id": id, "status": status})))
}

async fn scan_log(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let job = state.executor.db().job(&id).await?;
    let path = job
        .log_path
        .ok_or_else(|| ScanError::NotFound(format!("log for job {id}")))?;
    let text = match tokio::fs::read(&path).await {
        Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ScanError::NotFound(format!("log for job {id}")))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

/// Follows the log recorded on the job row. Ids without a job or without a
/// log get a single not-found event.
async fn stream_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let log_path = match state.executor.db().job(&id).await {
        Ok(job) => job.log_path.map(PathBuf::from),
        Err(ScanError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    let events = match log_path {
        Some(path) => tail_log(id, path, state.config.tail_options(), state.shutdown.child_token()).right_stream(),
        None => futures::stream::iter([LogEvent::NotFound(id)]).left_stream(),
    }
    .map(|event: LogEvent| Ok(Event::default().data(Value::String(event.payload()).to_string())));

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive")))
}

async fn list_findings(State(state): State<AppState>, Query(filter): Query<FindingFilter>) -> Result<Json<Value>> {
    let db = state.executor.db().clone();
    let key = filter.cache_key();
    let rows = state
        .cache
        .get_or_fetch(&key, READ_TTL, || async move {
            Ok::<_, ScanError>(serde_json::to_value(db.list_findings(&filter).await?)?)
        })
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct UpdateFindingRequest {
    status: FindingStatus,
}

async fn update_finding(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateFindingRequest>,
) -> Result<Json<Value>> {
    state.executor.db().set_finding_status(id, req.status).await?;
    state.cache.invalidate_pattern("findings");
    info!(finding_id = id, status = req.status.as_str(), "finding triaged");
    Ok(Json(serde_json::to_value(state.executor.db().finding(id).await?)?))
}

async fn rescan_finding(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>> {
    let outcome = state.executor.rescan_finding(id).await?;
    let message = if outcome.possibly_fixed {
        "No vulnerabilities found - possibly fixed"
    } else {
        "Vulnerability still present"
    };
    Ok(Json(json!({ "message": message, "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
pub struct ImportQuery {
    name: Option<String>,
}

async fn import_findings(
    State(state): State<AppState>,
    Query(q): Query<ImportQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let name = q.name.unwrap_or_else(|| "import".to_string());
    let outcome = state.executor.import_results(&body, &name).await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(outcome)?)))
}
