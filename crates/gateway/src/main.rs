use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleet_backend::HttpFleetBackend;
use fleet_core::{FanOut, FleetContext};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Coordinates, SessionId},
    error::{ApiError, ErrorCode},
    protocol::{CommandAck, StartSessionResponse},
};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod sweeper;

use app_state::AppState;
use config::load_settings;
use sweeper::spawn_session_sweeper;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FanOutQuery {
    session_id: Option<String>,
    timeout_ms: Option<u64>,
}

impl FanOutQuery {
    fn budget(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    rover: Option<String>,
    direction: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    rover: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    rover: Option<String>,
    task: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoordinateRequest {
    session_id: Option<String>,
    task: Option<String>,
    target: Option<Coordinates>,
    crew: Option<usize>,
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let backend = HttpFleetBackend::new(settings.backend_config())?;
    info!(
        backend_url = %backend.config().base_url,
        read_attempts = backend.config().read_attempts,
        rovers = settings.rovers.len(),
        "fleet backend configured"
    );

    let fleet = FleetContext::new(
        settings.fleet_profile(),
        Arc::new(backend),
        settings.fleet_options(),
    );
    let _sweeper = spawn_session_sweeper(fleet.clone(), settings.sweep_interval());

    let app = build_router(Arc::new(AppState { fleet }));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/session/start", post(start_session))
        .route("/api/fleet/status", get(fleet_status))
        .route("/api/fleet/cached", get(cached_status))
        .route("/api/rover/status", get(rover_status))
        .route("/api/rover/sensor-data", get(sensor_data))
        .route("/api/rover/battery", get(battery))
        .route("/api/rover/coordinates", get(coordinates))
        .route("/api/rover/sensor-health", get(sensor_health))
        .route("/api/fleet/coordinate", post(coordinate_task))
        .route("/api/rover/move", post(move_rover))
        .route("/api/rover/reset", post(reset_rover))
        .route("/api/rover/task", post(assign_task))
        .route("/api/events/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidSession
        | ErrorCode::MissingField
        | ErrorCode::InvalidDirection
        | ErrorCode::InvalidTask
        | ErrorCode::UnknownRover => StatusCode::BAD_REQUEST,
        ErrorCode::NoData => StatusCode::NOT_FOUND,
        ErrorCode::RoverBusy | ErrorCode::InsufficientBattery => StatusCode::CONFLICT,
        ErrorCode::BackendUnavailable => StatusCode::BAD_GATEWAY,
        ErrorCode::BackendTimeout | ErrorCode::CommandUncertain => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::PartialFailure => StatusCode::MULTI_STATUS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

fn bad_body(rejection: JsonRejection) -> (StatusCode, Json<ApiError>) {
    reject(ApiError::new(
        ErrorCode::MissingField,
        format!("malformed request body: {}", rejection.body_text()),
    ))
}

fn bad_query(rejection: QueryRejection) -> (StatusCode, Json<ApiError>) {
    reject(ApiError::new(
        ErrorCode::MissingField,
        format!("malformed query: {}", rejection.body_text()),
    ))
}

/// `200` with the rover map, `207` with an extra `errors` entry when some
/// rovers failed. When none answered: `504` if every rover timed out, `502`
/// otherwise.
fn fan_out_response<T: Serialize>(out: FanOut<T>) -> Response {
    if out.is_total_failure() {
        let detail = out
            .errors
            .iter()
            .map(|(rover, err)| format!("{rover}: {}", err.message))
            .collect::<Vec<_>>()
            .join("; ");
        let code = if out
            .errors
            .values()
            .all(|err| err.code == ErrorCode::BackendTimeout)
        {
            ErrorCode::BackendTimeout
        } else {
            ErrorCode::BackendUnavailable
        };
        let status = out.errors.values().find_map(|err| err.upstream_status);
        return reject(
            ApiError::new(code, format!("no rover answered: {detail}")).with_upstream_status(status),
        )
        .into_response();
    }

    let mut body = serde_json::Map::new();
    for (rover, value) in out.results {
        match serde_json::to_value(value) {
            Ok(value) => {
                body.insert(rover.0, value);
            }
            Err(err) => {
                return reject(ApiError::new(ErrorCode::Internal, err.to_string())).into_response();
            }
        }
    }
    if out.errors.is_empty() {
        return (StatusCode::OK, Json(body)).into_response();
    }
    match serde_json::to_value(&out.errors) {
        Ok(errors) => {
            body.insert("errors".to_string(), errors);
            (status_for(ErrorCode::PartialFailure), Json(body)).into_response()
        }
        Err(err) => reject(ApiError::new(ErrorCode::Internal, err.to_string())).into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn start_session(State(state): State<Arc<AppState>>) -> ApiResult<Json<StartSessionResponse>> {
    fleet_core::start_session(&state.fleet)
        .await
        .map(Json)
        .map_err(reject)
}

async fn fleet_status(
    State(state): State<Arc<AppState>>,
    query: Result<Query<FanOutQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(q) = query.map_err(bad_query)?;
    let out = fleet_core::fleet_status(&state.fleet, q.session_id.as_deref().unwrap_or_default(), q.budget())
        .await
        .map_err(reject)?;
    Ok(fan_out_response(out))
}

async fn cached_status(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(q) = query.map_err(bad_query)?;
    let snapshot = fleet_core::cached_status(&state.fleet, q.session_id.as_deref().unwrap_or_default())
        .await
        .map_err(reject)?;
    Ok(Json(snapshot).into_response())
}

async fn rover_status(
    State(state): State<Arc<AppState>>,
    query: Result<Query<FanOutQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(q) = query.map_err(bad_query)?;
    let out = fleet_core::rover_status(&state.fleet, q.session_id.as_deref().unwrap_or_default(), q.budget())
        .await
        .map_err(reject)?;
    Ok(fan_out_response(out))
}

async fn sensor_data(
    State(state): State<Arc<AppState>>,
    query: Result<Query<FanOutQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(q) = query.map_err(bad_query)?;
    let out = fleet_core::sensor_data(&state.fleet, q.session_id.as_deref().unwrap_or_default(), q.budget())
        .await
        .map_err(reject)?;
    Ok(fan_out_response(out))
}

async fn battery(
    State(state): State<Arc<AppState>>,
    query: Result<Query<FanOutQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(q) = query.map_err(bad_query)?;
    let out = fleet_core::battery_levels(&state.fleet, q.session_id.as_deref().unwrap_or_default(), q.budget())
        .await
        .map_err(reject)?;
    Ok(fan_out_response(out))
}

async fn coordinates(
    State(state): State<Arc<AppState>>,
    query: Result<Query<FanOutQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(q) = query.map_err(bad_query)?;
    let out = fleet_core::coordinates(&state.fleet, q.session_id.as_deref().unwrap_or_default(), q.budget())
        .await
        .map_err(reject)?;
    Ok(fan_out_response(out))
}

async fn sensor_health(
    State(state): State<Arc<AppState>>,
    query: Result<Query<FanOutQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(q) = query.map_err(bad_query)?;
    let out = fleet_core::sensor_health(&state.fleet, q.session_id.as_deref().unwrap_or_default(), q.budget())
        .await
        .map_err(reject)?;
    Ok(fan_out_response(out))
}

/// `200` when every picked rover took the task, `207` when some did not. If
/// none did, the first rover's error is returned.
async fn coordinate_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CoordinateRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = payload.map_err(bad_body)?;
    let Some(target) = req.target else {
        return Err(reject(ApiError::new(ErrorCode::MissingField, "target is required")));
    };
    let plan = fleet_core::coordinate_task(
        &state.fleet,
        req.session_id.as_deref().unwrap_or_default(),
        req.task.as_deref().unwrap_or_default(),
        target,
        req.crew,
        req.timeout_ms.map(Duration::from_millis),
    )
    .await
    .map_err(reject)?;

    if plan.assigned.is_empty() {
        if let Some(err) = plan.errors.values().next() {
            return Err(reject(err.clone()));
        }
    }
    let status = if plan.errors.is_empty() {
        StatusCode::OK
    } else {
        status_for(ErrorCode::PartialFailure)
    };
    Ok((status, Json(plan)).into_response())
}

async fn move_rover(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MoveRequest>, JsonRejection>,
) -> ApiResult<Json<CommandAck>> {
    let Json(req) = payload.map_err(bad_body)?;
    fleet_core::move_rover(
        &state.fleet,
        req.session_id.as_deref().unwrap_or_default(),
        req.rover.as_deref().unwrap_or_default(),
        req.direction.as_deref().unwrap_or_default(),
    )
    .await
    .map(Json)
    .map_err(reject)
}

async fn reset_rover(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ResetRequest>, JsonRejection>,
) -> ApiResult<Json<CommandAck>> {
    let Json(req) = payload.map_err(bad_body)?;
    fleet_core::reset_rover(
        &state.fleet,
        req.session_id.as_deref().unwrap_or_default(),
        req.rover.as_deref().unwrap_or_default(),
    )
    .await
    .map(Json)
    .map_err(reject)
}

async fn assign_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TaskRequest>, JsonRejection>,
) -> ApiResult<Json<CommandAck>> {
    let Json(req) = payload.map_err(bad_body)?;
    fleet_core::assign_task(
        &state.fleet,
        req.session_id.as_deref().unwrap_or_default(),
        req.rover.as_deref().unwrap_or_default(),
        req.task.as_deref().unwrap_or_default(),
    )
    .await
    .map(Json)
    .map_err(reject)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(q) = query.map_err(bad_query)?;
    let session = state
        .fleet
        .sessions
        .validate(q.session_id.as_deref().unwrap_or_default())
        .await
        .map_err(reject)?;
    Ok(ws
        .on_upgrade(move |socket| ws_connection(state, socket, session.id))
        .into_response())
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    session_id: SessionId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.fleet.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped, "event subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if event.session_id() != &session_id {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
