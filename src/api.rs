//! HTTP API handlers for Ember.
//!
//! The HTTP surface is a thin shell around [`StreakService`]: handlers assign
//! the server-side timestamp, call the service, and map outcomes to status
//! codes. The sweep endpoints exist for the external scheduler (cron, cloud
//! scheduler, systemd timer) to invoke; Ember itself never arms a timer.
//!
//! - `POST /activity` - Record an activity (server-assigned timestamp)
//! - `POST /users` - Initialize a streak record for a new user
//! - `GET /streak/{user_id}` - Current streak snapshot
//! - `POST /sweeps/at-risk` - Run the at-risk sweep now
//! - `POST /sweeps/reset` - Run the reset sweep now
//! - `GET /health` - Health check

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::model::{ActivityRequest, CreateUserRequest, StreakSnapshot, SweepReport};
use crate::service::{ServiceError, StreakService};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: StreakService,
}

/// Build the full router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/activity", post(post_activity))
        .route("/users", post(post_user))
        .route("/streak/:user_id", get(get_streak))
        .route("/sweeps/at-risk", post(post_at_risk_sweep))
        .route("/sweeps/reset", post(post_reset_sweep))
        .route("/health", get(health_check))
        .with_state(state)
}

/// POST /activity - Record an activity event.
///
/// The timestamp is assigned server-side; clients cannot backdate through this
/// endpoint. A user with no record yet is treated as a first activity, not an
/// error.
///
/// # Request Body
///
/// ```json
/// {
///     "user_id": "u-123",
///     "activity_type": "workout"
/// }
/// ```
///
/// `activity_type` is optional and free-form.
///
/// # Response
///
/// `202 Accepted` on success; `409 Conflict` if the record stayed contended
/// past the retry budget (the event is logged; resubmit to re-apply).
#[instrument(skip(state, request), fields(user_id = %request.user_id))]
pub async fn post_activity(
    State(state): State<AppState>,
    Json(request): Json<ActivityRequest>,
) -> impl IntoResponse {
    let now = Utc::now();

    match state
        .service
        .record_activity(&request.user_id, &request.activity_type, now)
        .await
    {
        Ok(kind) => {
            info!(
                user_id = %request.user_id,
                activity_type = %request.activity_type,
                kind = ?kind,
                "Activity recorded"
            );
            StatusCode::ACCEPTED
        }
        Err(ServiceError::Conflict { user_id, attempts }) => {
            warn!(user_id = %user_id, attempts, "Activity transition kept conflicting");
            StatusCode::CONFLICT
        }
        Err(e) => {
            warn!(user_id = %request.user_id, error = %e, "Failed to record activity");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// POST /users - Initialize a streak record for a newly created user.
///
/// Idempotent: `201 Created` the first time, `200 OK` if the record already
/// existed.
#[instrument(skip(state, request), fields(user_id = %request.user_id))]
pub async fn post_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> impl IntoResponse {
    match state.service.init_user(&request.user_id).await {
        Ok(true) => StatusCode::CREATED,
        Ok(false) => StatusCode::OK,
        Err(e) => {
            warn!(user_id = %request.user_id, error = %e, "Failed to initialize user");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// GET /streak/{user_id} - Current streak snapshot for display.
///
/// # Response
///
/// ```json
/// {
///     "user_id": "u-123",
///     "current_streak": 4,
///     "best_streak": 9,
///     "last_activity_date": "2024-06-14",
///     "streak_start_date": "2024-06-11",
///     "is_at_risk": false,
///     "freezes_available": 0,
///     "freeze_active": false,
///     "active_days": ["2024-06-11", "2024-06-12", "2024-06-13", "2024-06-14"]
/// }
/// ```
///
/// `404 Not Found` for users with no record.
#[instrument(skip(state))]
pub async fn get_streak(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<StreakSnapshot>, StatusCode> {
    let now = Utc::now();

    match state.service.snapshot(&user_id, now).await {
        Ok(Some(snapshot)) => {
            info!(
                user_id = %user_id,
                current_streak = snapshot.current_streak,
                at_risk = snapshot.is_at_risk,
                "Streak queried"
            );
            Ok(Json(snapshot))
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Failed to read streak");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /sweeps/at-risk - Run the at-risk sweep against the current day.
#[instrument(skip(state))]
pub async fn post_at_risk_sweep(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, StatusCode> {
    let now = Utc::now();

    match state.service.run_at_risk_sweep(now).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            warn!(error = %e, "At-risk sweep failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /sweeps/reset - Run the reset sweep against the current day.
#[instrument(skip(state))]
pub async fn post_reset_sweep(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, StatusCode> {
    let now = Utc::now();

    match state.service.run_reset_sweep(now).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            warn!(error = %e, "Reset sweep failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
