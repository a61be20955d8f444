//! HTTP API over the session supervisor

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::grid::{
    GridConfig, GridError, GridResult, GridSupervisor, OrderBook, SessionSummary, StartedSession,
    SubscriptionHandle,
};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<GridSupervisor>,
}

/// Body of `POST /api/sessions`
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub symbol: String,
    pub config: GridConfig,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CancelAllResponse {
    pub symbol: String,
    pub cancelled: u32,
}

/// Grid error rendered as a JSON response
#[derive(Debug)]
pub struct ApiError(pub GridError);

impl From<GridError> for ApiError {
    fn from(e: GridError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            GridError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            GridError::SessionNotFound(_) | GridError::LevelNotFound(_) => StatusCode::NOT_FOUND,
            GridError::Exchange(_)
            | GridError::InsufficientBalance { .. }
            | GridError::OrderRejected(_)
            | GridError::OrderPlacementFailed { .. }
            | GridError::Initialization(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(start_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/summary", get(get_summary))
        .route("/api/subscriptions/:handle", delete(stop_session))
        .route("/api/cancel-all/:symbol", post(cancel_all))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(state: AppState, host: &str, port: u16, shutdown: F) -> GridResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| GridError::Config(format!("invalid server address {}:{}: {}", host, port, e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server running on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("API server stopped");
    Ok(())
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<OrderBook>>> {
    Ok(Json(state.supervisor.engine().sessions().await?))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OrderBook>> {
    state
        .supervisor
        .engine()
        .session(&id)
        .await?
        .map(Json)
        .ok_or(ApiError(GridError::SessionNotFound(id)))
}

async fn get_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    let Json(book) = get_session(State(state), Path(id)).await?;
    Ok(Json(book.summary()))
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<(StatusCode, Json<StartedSession>)> {
    let started = state
        .supervisor
        .start_session(&request.symbol, request.config)
        .await?;
    Ok((StatusCode::CREATED, Json(started)))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> (StatusCode, Json<StopResponse>) {
    let stopped = state
        .supervisor
        .stop_session(&SubscriptionHandle::new(handle))
        .await;
    let status = if stopped {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(StopResponse { stopped }))
}

async fn cancel_all(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> ApiResult<Json<CancelAllResponse>> {
    let cancelled = state.supervisor.engine().cancel_all(&symbol).await?;
    Ok(Json(CancelAllResponse { symbol, cancelled }))
}
