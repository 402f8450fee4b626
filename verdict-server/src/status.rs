//! Operational status endpoint.
//!
//! `GET /status` reports the job queue and the number of overdue pending
//! records. It requires `Authorization: Bearer <STATUS_AUTH_TOKEN>` and is
//! disabled entirely when no token is configured.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::jobs::JobCounts;
use crate::reconciliation::SWEEP_BATCH_SIZE;
use crate::AppState;

/// Full status data for rendering.
#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub jobs: JobCounts,
    /// Pending records past their deadline, capped at one sweep batch.
    pub overdue_pending: usize,
}

/// Validate the authorization header against the status auth token.
///
/// Returns `Ok(())` if authorized, or an error response if not.
#[allow(clippy::result_large_err)] // Response is large but this is idiomatic in Axum handlers
pub fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), Response> {
    // If no auth token is configured, the endpoint is disabled
    let Some(expected_token) = auth_token else {
        return Err((
            StatusCode::FORBIDDEN,
            "Status endpoint is disabled (STATUS_AUTH_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(value) => match value.strip_prefix("Bearer ") {
            Some(provided) if provided == expected_token => Ok(()),
            Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
            None => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header format. Expected: Bearer <token>",
            )
                .into_response()),
        },
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

/// Handler: GET /status
pub async fn status_handler(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    if let Err(response) = validate_auth(&headers, &state.status_auth_token) {
        return response;
    }

    let repo = state.service.store().repository();
    let jobs = match repo.job_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            error!("Failed to read job counts: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let now = state.service.clock().now();
    let overdue_pending = match repo.list_due_pending(now, SWEEP_BATCH_SIZE).await {
        Ok(records) => records.len(),
        Err(e) => {
            error!("Failed to list overdue feedback: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Json(StatusData {
        version: verdict_core::get_version(),
        jobs,
        overdue_pending,
    })
    .into_response()
}
