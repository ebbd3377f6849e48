use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::error;
use utoipa::{OpenApi, ToSchema};

use quark_bus::{BusError, EventBus, HistoryQuery};
use quark_core::{
    Event, HealthCheckResult, ModuleRecord, ServiceRecord, ServiceRegistration, ServiceStatus, ServiceType,
};
use quark_registry::{HealthMonitor, Registry, RegistryError};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub monitor: Arc<HealthMonitor>,
    pub bus: Arc<EventBus>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        register_service,
        list_services,
        service_stats,
        search_services,
        get_service,
        unregister_service,
        heartbeat,
        update_status,
        register_module,
        list_modules,
        get_module,
        unregister_module,
        all_health,
        health_summary,
        service_health,
        check_service,
        publish_event,
        event_history,
        system_status,
    ),
    components(schemas(
        ServiceRegistration,
        ServiceRecord,
        quark_core::ServiceType,
        quark_core::ServiceStatus,
        quark_core::ServiceHealth,
        quark_core::Resources,
        ModuleRecord,
        quark_core::ModuleType,
        quark_core::ModuleManifest,
        quark_core::ModuleRuntime,
        quark_core::RuntimeEngine,
        quark_core::ResourceLimits,
        quark_core::ModuleApi,
        quark_core::ApiEndpoint,
        quark_core::EventDefinition,
        quark_core::EventDirection,
        quark_core::ModuleDependency,
        quark_core::DependencyKind,
        HealthCheckResult,
        quark_core::HealthStatus,
        Event,
        StatusUpdate,
        PublishRequest,
        EventInput,
    ))
)]
pub struct ApiDoc;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/services/register", post(register_service))
        .route("/api/services", get(list_services))
        .route("/api/services/stats", get(service_stats))
        .route("/api/services/search/:pattern", get(search_services))
        .route("/api/services/:id", get(get_service).delete(unregister_service))
        .route("/api/services/:id/heartbeat", post(heartbeat))
        .route("/api/services/:id/status", axum::routing::put(update_status))
        .route("/api/modules/register", post(register_module))
        .route("/api/modules", get(list_modules))
        .route("/api/modules/:id", get(get_module).delete(unregister_module))
        .route("/api/health", get(all_health))
        .route("/api/health/summary", get(health_summary))
        .route("/api/health/service/:id", get(service_health))
        .route("/api/health/check/:id", post(check_service))
        .route("/api/events/publish", post(publish_event))
        .route("/api/events/history/:subject", get(event_history))
        .route("/api/system/status", get(system_status))
        .with_state(state)
}

/// Every JSON body the hub returns.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
        timestamp: Utc::now(),
    })
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string()),
        };
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(_) | RegistryError::InvalidModuleId(_) => ApiError::BadRequest(err.to_string()),
            RegistryError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            RegistryError::Bus(err) => err.into(),
            other => {
                error!(error = %other, "registry operation failed");
                ApiError::Internal
            }
        }
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::InvalidSubject(_) => ApiError::BadRequest(err.to_string()),
            other => {
                error!(error = %other, "event bus operation failed");
                ApiError::Internal
            }
        }
    }
}

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Hub is up")))]
async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    ok(json!({
        "status": "healthy",
        "eventBus": state.bus.is_connected(),
        "monitoring": state.monitor.is_running(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/services/register",
    request_body = ServiceRegistration,
    responses(
        (status = 201, description = "Service registered", body = ServiceRecord),
        (status = 400, description = "Missing id, name or type")
    )
)]
async fn register_service(
    State(state): State<AppState>,
    Json(payload): Json<ServiceRegistration>,
) -> Result<(StatusCode, Json<ApiResponse<ServiceRecord>>), ApiError> {
    let record = state.registry.register_service(payload).await?;
    Ok((StatusCode::CREATED, ok(record)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/services",
    params(("type" = Option<String>, Query, description = "Only services of this type")),
    responses((status = 200, description = "Registered services", body = [ServiceRecord]))
)]
async fn list_services(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult<Vec<ServiceRecord>> {
    let services = match query.kind.as_deref() {
        None | Some("") => state.registry.all_services()?,
        Some(kind) => {
            let kind: ServiceType = kind.parse().map_err(ApiError::BadRequest)?;
            state.registry.services_by_type(kind)?
        }
    };
    Ok(ok(services))
}

#[utoipa::path(get, path = "/api/services/stats", responses((status = 200, description = "Aggregate counts")))]
async fn service_stats(State(state): State<AppState>) -> ApiResult<quark_registry::ServiceStats> {
    Ok(ok(state.registry.service_stats()?))
}

#[utoipa::path(
    get,
    path = "/api/services/search/{pattern}",
    params(("pattern" = String, Path, description = "Case-insensitive regex over id, name and type")),
    responses((status = 200, description = "Matching services", body = [ServiceRecord]))
)]
async fn search_services(State(state): State<AppState>, Path(pattern): Path<String>) -> ApiResult<Vec<ServiceRecord>> {
    Ok(ok(state.registry.find_by_pattern(&pattern)?))
}

#[utoipa::path(
    get,
    path = "/api/services/{id}",
    params(("id" = String, Path, description = "Service id")),
    responses(
        (status = 200, description = "Service", body = ServiceRecord),
        (status = 404, description = "Unknown id")
    )
)]
async fn get_service(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ServiceRecord> {
    match state.registry.get_service(&id)? {
        Some(service) => Ok(ok(service)),
        None => Err(RegistryError::service_not_found(id).into()),
    }
}

#[utoipa::path(
    delete,
    path = "/api/services/{id}",
    params(("id" = String, Path, description = "Service id")),
    responses((status = 200, description = "Removed, or already absent"))
)]
async fn unregister_service(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let removed = state.registry.unregister_service(&id).await?;
    Ok(ok(json!({ "serviceId": id, "removed": removed })))
}

#[utoipa::path(
    post,
    path = "/api/services/{id}/heartbeat",
    params(("id" = String, Path, description = "Service id")),
    responses((status = 200, description = "Heartbeat accepted"))
)]
async fn heartbeat(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    state.registry.heartbeat(&id)?;
    Ok(ok(json!({ "serviceId": id })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusUpdate {
    status: ServiceStatus,
}

#[utoipa::path(
    put,
    path = "/api/services/{id}/status",
    params(("id" = String, Path, description = "Service id")),
    request_body = StatusUpdate,
    responses(
        (status = 200, description = "Status updated"),
        (status = 404, description = "Unknown id")
    )
)]
async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<StatusUpdate>,
) -> ApiResult<Value> {
    if !state.registry.update_status(&id, payload.status)? {
        return Err(RegistryError::service_not_found(id).into());
    }
    Ok(ok(json!({ "serviceId": id, "status": payload.status })))
}

#[utoipa::path(
    post,
    path = "/api/modules/register",
    request_body = ModuleRecord,
    responses(
        (status = 201, description = "Module registered", body = ModuleRecord),
        (status = 400, description = "Incomplete module definition")
    )
)]
async fn register_module(
    State(state): State<AppState>,
    Json(payload): Json<ModuleRecord>,
) -> Result<(StatusCode, Json<ApiResponse<ModuleRecord>>), ApiError> {
    let module = state.registry.register_module(payload).await?;
    Ok((StatusCode::CREATED, ok(module)))
}

#[utoipa::path(get, path = "/api/modules", responses((status = 200, description = "Modules", body = [ModuleRecord])))]
async fn list_modules(State(state): State<AppState>) -> ApiResult<Vec<ModuleRecord>> {
    Ok(ok(state.registry.all_modules()?))
}

#[utoipa::path(
    get,
    path = "/api/modules/{id}",
    params(("id" = String, Path, description = "Module id")),
    responses((status = 200, description = "Module", body = ModuleRecord), (status = 404, description = "Unknown id"))
)]
async fn get_module(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ModuleRecord> {
    match state.registry.get_module(&id)? {
        Some(module) => Ok(ok(module)),
        None => Err(RegistryError::module_not_found(id).into()),
    }
}

#[utoipa::path(
    delete,
    path = "/api/modules/{id}",
    params(("id" = String, Path, description = "Module id")),
    responses((status = 200, description = "Removed, or already absent"))
)]
async fn unregister_module(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let removed = state.registry.unregister_module(&id).await?;
    Ok(ok(json!({ "moduleId": id, "removed": removed })))
}

#[utoipa::path(get, path = "/api/health", responses((status = 200, description = "Latest check per service", body = [HealthCheckResult])))]
async fn all_health(State(state): State<AppState>) -> ApiResult<Vec<HealthCheckResult>> {
    Ok(ok(state.registry.all_health()?))
}

#[utoipa::path(get, path = "/api/health/summary", responses((status = 200, description = "Health counts and latest results")))]
async fn health_summary(State(state): State<AppState>) -> ApiResult<quark_registry::HealthSummary> {
    Ok(ok(state.monitor.health_summary()?))
}

#[utoipa::path(
    get,
    path = "/api/health/service/{id}",
    params(("id" = String, Path, description = "Service id")),
    responses((status = 200, description = "Latest check", body = HealthCheckResult), (status = 404, description = "No check recorded"))
)]
async fn service_health(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<HealthCheckResult> {
    match state.registry.get_health(&id)? {
        Some(result) => Ok(ok(result)),
        None => Err(ApiError::NotFound(format!("no health information for '{id}'"))),
    }
}

#[utoipa::path(
    post,
    path = "/api/health/check/{id}",
    params(("id" = String, Path, description = "Service id")),
    responses((status = 200, description = "Fresh check", body = HealthCheckResult), (status = 404, description = "Unknown id"))
)]
async fn check_service(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<HealthCheckResult> {
    match state.monitor.check_service(&id).await? {
        Some(result) => Ok(ok(result)),
        None => Err(RegistryError::service_not_found(id).into()),
    }
}

/// Event as accepted from clients. Missing `id`, `source` and `timestamp`
/// are filled in by the hub.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    source: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schema(value_type = Object)]
    data: Value,
    #[schema(value_type = Object)]
    metadata: Option<Map<String, Value>>,
    module_id: Option<String>,
    version: Option<String>,
}

impl EventInput {
    fn into_event(self) -> Event {
        let mut event = Event::new(self.kind, self.source.unwrap_or_else(|| "api".to_string()), self.data);
        if let Some(id) = self.id.filter(|id| !id.trim().is_empty()) {
            event.id = id;
        }
        if let Some(timestamp) = self.timestamp {
            event.timestamp = timestamp;
        }
        event.metadata = self.metadata;
        event.module_id = self.module_id;
        event.version = self.version;
        event
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishRequest {
    #[serde(default)]
    subject: String,
    event: Option<EventInput>,
}

#[utoipa::path(
    post,
    path = "/api/events/publish",
    request_body = PublishRequest,
    responses(
        (status = 200, description = "Event published"),
        (status = 400, description = "Missing subject or event, or invalid subject")
    )
)]
async fn publish_event(State(state): State<AppState>, Json(payload): Json<PublishRequest>) -> ApiResult<Value> {
    let Some(input) = payload.event.filter(|_| !payload.subject.trim().is_empty()) else {
        return Err(ApiError::BadRequest("subject and event are required".to_string()));
    };
    let event = input.into_event();
    let sequence = state.bus.publish(&payload.subject, &event).await?;
    Ok(ok(json!({
        "message": "event published",
        "subject": payload.subject,
        "eventId": event.id,
        "sequence": sequence,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    limit: Option<usize>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[utoipa::path(
    get,
    path = "/api/events/history/{subject}",
    params(
        ("subject" = String, Path, description = "Subject or wildcard pattern"),
        ("limit" = Option<usize>, Query, description = "Most recent N events, default 100"),
        ("startTime" = Option<String>, Query, description = "ISO-8601 lower bound"),
        ("endTime" = Option<String>, Query, description = "ISO-8601 upper bound")
    ),
    responses((status = 200, description = "Retained events, oldest first", body = [Event]))
)]
async fn event_history(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<Event>> {
    let query = HistoryQuery {
        start: params.start_time,
        end: params.end_time,
        limit: Some(params.limit.unwrap_or(100)),
    };
    Ok(ok(state.bus.event_history(&subject, &query).await?))
}

#[utoipa::path(get, path = "/api/system/status", responses((status = 200, description = "Combined hub status")))]
async fn system_status(State(state): State<AppState>) -> ApiResult<Value> {
    let services = state.registry.service_stats()?;
    let health = state.monitor.health_summary()?;
    let stream = match state.bus.stream_info().await {
        Ok(info) => serde_json::to_value(info).ok(),
        Err(err) => {
            error!(error = %err, "stream info unavailable");
            None
        }
    };

    Ok(ok(json!({
        "services": services,
        "health": health,
        "eventBus": state.bus.connection_info(),
        "stream": stream,
        "monitoring": state.monitor.monitoring_stats(),
    })))
}
