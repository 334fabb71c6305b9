// src/api.rs
//! Thin HTTP + WebSocket surface over the pipeline.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::aggregate::query::{BoundingBox, EventQuery};
use crate::aggregate::{FireEvent, FireEventProperties, Point, TownshipDirectory};
use crate::error::{AdapterError, AggregateError, IngestError};
use crate::ingest::registry::DataSourceRegistry;
use crate::ingest::types::{ExternalSourceConfig, SourceType};
use crate::pipeline::Pipeline;
use crate::realtime::Subscription;
use crate::storage::StorageHandle;

/// Handlers share the running pipeline; it lives as long as any router clone.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self::shared(Arc::new(pipeline))
    }

    pub fn shared(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    fn registry(&self) -> &DataSourceRegistry {
        self.pipeline.registry()
    }

    fn townships(&self) -> &TownshipDirectory {
        self.pipeline.townships()
    }

    fn storage(&self) -> &StorageHandle {
        self.pipeline.storage()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/sources", post(register_source).get(list_sources))
        .route("/sources/status", get(all_status))
        .route(
            "/sources/{id}",
            get(get_source).put(update_source).delete(unregister_source),
        )
        .route("/sources/{id}/start", post(start_polling))
        .route("/sources/{id}/stop", post(stop_polling))
        .route("/sources/{id}/fetch", post(trigger_fetch))
        .route("/webhooks/{provider_type}", post(webhook))
        .route("/fire-events/township/{name}", get(township_events).post(add_township_event))
        .route("/fire-events/township/{name}/summary", get(township_summary))
        .route(
            "/fire-events/township/{name}/{event_id}",
            put(update_township_event).delete(remove_township_event),
        )
        .route("/fire-events/bbox", get(bbox_events))
        .route("/fire-events/today", get(active_today))
        .route("/storage/counts", get(storage_counts))
        .route("/ws", get(realtime_ws))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---- errors ----

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Internal(msg) => {
                tracing::error!(target: "api", error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::NotFound(_) => Self::NotFound(e.to_string()),
            IngestError::InvalidConfig(_)
            | IngestError::Duplicate(_)
            | IngestError::AlreadyInitialized(_)
            | IngestError::NotInitialized(_)
            | IngestError::IllegalTransition { .. }
            | IngestError::Adapter(AdapterError::Config(_)) => Self::BadRequest(e.to_string()),
            IngestError::ActorUnavailable(_) | IngestError::Adapter(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<AggregateError> for ApiError {
    fn from(e: AggregateError) -> Self {
        match e {
            AggregateError::InvalidKey(_) => Self::BadRequest(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---- sources ----

async fn register_source(
    State(state): State<AppState>,
    Json(config): Json<ExternalSourceConfig>,
) -> ApiResult<(StatusCode, Json<ExternalSourceConfig>)> {
    state.registry().add_source(config.clone()).await?;
    state.registry().start_polling(&config.id).await?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<ExternalSourceConfig>> {
    Json(state.registry().list())
}

async fn all_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry().get_all_status().await)
}

async fn get_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let config = state
        .registry()
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("source {id} is not registered")))?;
    let status = state.registry().get_status(&id).await?;
    Ok(Json(json!({ "config": config, "status": status })))
}

async fn update_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut config): Json<ExternalSourceConfig>,
) -> ApiResult<Json<ExternalSourceConfig>> {
    config.id = id;
    if let Some(other) = state.registry().find_by_name(&config.name) {
        if other.id != config.id {
            return Err(ApiError::BadRequest(format!("a source named {:?} already exists", config.name)));
        }
    }
    state.registry().update_source(config.clone()).await?;
    Ok(Json(config))
}

async fn unregister_source(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    if state.registry().unregister_source(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("source {id} is not registered")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PollingResp {
    source_id: String,
    changed: bool,
}

async fn start_polling(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<PollingResp>> {
    let changed = state.registry().start_polling(&id).await?;
    Ok(Json(PollingResp { source_id: id, changed }))
}

async fn stop_polling(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<PollingResp>> {
    let changed = state.registry().stop_polling(&id).await?;
    Ok(Json(PollingResp { source_id: id, changed }))
}

async fn trigger_fetch(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let handle = state.registry().handle(&id)?;
    Ok(Json(handle.trigger_fetch().await?))
}

// ---- webhooks ----

#[derive(Deserialize)]
struct WebhookParams {
    source_id: Option<String>,
}

/// Always 200: processing failures are reported in the body, never as an HTTP error.
async fn webhook(
    State(state): State<AppState>,
    Path(provider_type): Path<String>,
    Query(params): Query<WebhookParams>,
    body: String,
) -> Json<serde_json::Value> {
    let Some(source_type) = SourceType::parse(&provider_type) else {
        tracing::warn!(target: "api", provider_type = %provider_type, "webhook for unknown provider type");
        return Json(json!({ "received": true, "accepted": false, "reason": "unknown provider type" }));
    };

    let target = match params.source_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => state.registry().get(id).filter(|c| c.source_type == source_type),
        None => state
            .registry()
            .list()
            .into_iter()
            .find(|c| c.source_type == source_type && c.is_active),
    };
    let Some(target) = target else {
        tracing::warn!(target: "api", provider_type = %source_type, source_id = ?params.source_id, "webhook has no matching source");
        return Json(json!({ "received": true, "accepted": false, "reason": "no matching source" }));
    };

    let outcome = match state.registry().handle(&target.id) {
        Ok(h) => h.process_webhook(body).await,
        Err(e) => {
            tracing::warn!(target: "api", source_id = %target.id, error = %e, "webhook target vanished");
            return Json(json!({ "received": true, "accepted": false, "reason": e.to_string() }));
        }
    };
    Json(json!({ "received": true, "sourceId": target.id, "result": outcome }))
}

// ---- fire events ----

/// Flat query string; `serde_urlencoded` cannot fill nested structs.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventParams {
    from_date: Option<DateTime<Utc>>,
    to_date: Option<DateTime<Utc>>,
    status: Option<String>,
    min_intensity: Option<f64>,
    max_intensity: Option<f64>,
    min_lon: Option<f64>,
    min_lat: Option<f64>,
    max_lon: Option<f64>,
    max_lat: Option<f64>,
}

impl EventParams {
    fn query(&self) -> EventQuery {
        EventQuery {
            from_date: self.from_date,
            to_date: self.to_date,
            status: self.status.clone().filter(|s| !s.trim().is_empty()),
            min_intensity: self.min_intensity,
            max_intensity: self.max_intensity,
            bbox: None,
        }
    }

    fn bbox(&self) -> ApiResult<BoundingBox> {
        match (self.min_lon, self.min_lat, self.max_lon, self.max_lat) {
            (Some(min_lon), Some(min_lat), Some(max_lon), Some(max_lat)) => {
                let bbox = BoundingBox {
                    min_lon,
                    min_lat,
                    max_lon,
                    max_lat,
                };
                if bbox.is_valid() {
                    Ok(bbox)
                } else {
                    Err(ApiError::BadRequest("bounding box minimums exceed maximums".into()))
                }
            }
            _ => Err(ApiError::BadRequest(
                "minLon, minLat, maxLon and maxLat are all required".into(),
            )),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsResp {
    events: Vec<FireEvent>,
    total_count: usize,
}

impl From<Vec<FireEvent>> for EventsResp {
    fn from(events: Vec<FireEvent>) -> Self {
        Self {
            total_count: events.len(),
            events,
        }
    }
}

async fn township_events(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<EventParams>,
) -> ApiResult<Json<EventsResp>> {
    let events = state.townships().get(&name)?.get_events(params.query()).await?;
    Ok(Json(events.into()))
}

/// Event body for create; the id is generated when absent.
#[derive(Deserialize)]
struct NewFireEvent {
    #[serde(default)]
    id: Option<String>,
    geometry: Point,
    properties: FireEventProperties,
}

async fn add_township_event(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<NewFireEvent>,
) -> ApiResult<(StatusCode, Json<FireEvent>)> {
    let event = FireEvent {
        id: body
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        township: String::new(),
        geometry: body.geometry,
        properties: body.properties,
    };
    let stored = state.townships().get(&name)?.add_event(event).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn update_township_event(
    State(state): State<AppState>,
    Path((name, event_id)): Path<(String, String)>,
    Json(mut event): Json<FireEvent>,
) -> ApiResult<Json<FireEvent>> {
    event.id = event_id;
    let township = state.townships().get(&name)?;
    if !township.update_event(event.clone()).await? {
        return Err(ApiError::NotFound(format!("event {} not in township {}", event.id, township.key())));
    }
    event.township = township.key().to_string();
    Ok(Json(event))
}

async fn remove_township_event(
    State(state): State<AppState>,
    Path((name, event_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let township = state.townships().get(&name)?;
    if township.remove_event(event_id.clone()).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("event {event_id} not in township {}", township.key())))
    }
}

async fn township_summary(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.townships().get(&name)?.get_summary().await?))
}

async fn bbox_events(State(state): State<AppState>, Query(params): Query<EventParams>) -> ApiResult<Json<EventsResp>> {
    let bbox = params.bbox()?;
    let events = state.townships().query_bbox(bbox, params.query()).await;
    Ok(Json(events.into()))
}

async fn active_today(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.townships().active_today().await)
}

async fn storage_counts(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let counts = state
        .storage()
        .reader()
        .counts()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(counts))
}

// ---- realtime ----

#[derive(Deserialize)]
struct WsParams {
    group: Option<String>,
}

async fn realtime_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Response {
    let fanout = state.townships().fanout();
    let sub = match params.group.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
        Some(group) => fanout.subscribe(group),
        None => fanout.subscribe_global(),
    };
    ws.on_upgrade(move |socket| push_notifications(socket, sub))
}

async fn push_notifications(mut socket: WebSocket, mut sub: Subscription) {
    loop {
        tokio::select! {
            next = sub.recv() => {
                let Some(notification) = next else { break };
                let text = match serde_json::to_string(&notification) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(target: "api", error = %e, "notification not serializable");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(target: "api", "realtime client disconnected");
}
