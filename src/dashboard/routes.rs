//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::{AccountStatus, LaneManager, PendingPlacement, StatusReporter};
use crate::types::{AccountSettings, LaneError, LaneStatistics};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub reporter: StatusReporter,
    pub manager: Arc<LaneManager>,
}

impl DashboardState {
    pub fn new(manager: Arc<LaneManager>) -> Self {
        Self {
            reporter: StatusReporter::new(manager.store()),
            manager,
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: String,
    pub pending_placements: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatisticsQuery {
    #[serde(default = "default_window_days")]
    pub days: u32,
}

fn default_window_days() -> u32 {
    30
}

/// `LaneError` as an HTTP response.
pub struct ApiError(pub LaneError);

impl From<LaneError> for ApiError {
    fn from(err: LaneError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LaneError::NotFound(_) | LaneError::LaneNotFound(_) => StatusCode::NOT_FOUND,
            LaneError::Configuration(_) => StatusCode::BAD_REQUEST,
            LaneError::PersistenceUnavailable(_) | LaneError::Timeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pending_placements = state.manager.pending_count().await;
    match state.reporter.health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store: "ok".into(),
                pending_placements,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                store: e.to_string(),
                pending_placements,
            }),
        ),
    }
}

/// GET /api/accounts
pub async fn get_accounts(
    State(state): State<AppState>,
) -> Result<Json<Vec<AccountStatus>>, ApiError> {
    Ok(Json(state.reporter.snapshot().await?))
}

/// GET /api/accounts/:account
pub async fn get_account(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Result<Json<AccountStatus>, ApiError> {
    Ok(Json(state.reporter.account_status(&account).await?))
}

/// GET /api/accounts/:account/settings
pub async fn get_settings(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Result<Json<AccountSettings>, ApiError> {
    Ok(Json(state.manager.settings(&account).await?))
}

/// GET /api/accounts/:account/statistics?days=N
pub async fn get_statistics(
    State(state): State<AppState>,
    Path(account): Path<String>,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<LaneStatistics>, ApiError> {
    Ok(Json(state.reporter.lane_statistics(&account, query.days).await?))
}

/// GET /api/accounts/:account/pending
pub async fn get_pending(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Json<Vec<PendingPlacement>> {
    Json(state.manager.pending_placements(&account).await)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
