//! HTTP API routes for the hosted roles
//!
//! Every role lives under its own path prefix, which is also the first path
//! segment remote actors call (`POST {host}/{role}/{mode}`). Error bodies are
//! always `{"error": {"code", "message"}}`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

pub mod aggregator;
pub mod conductor;
pub mod target;

use crate::actors::conductor::ConductorError;
use crate::actors::target::TargetError;
use crate::app_state::AppState;
use crate::profile::ProfileError;
use crate::remote::Role;
use crate::store::StoreError;

#[derive(Clone)]
pub struct ApiState {
    pub app_state: AppState,
    pub roles: Vec<Role>,
}

/// Routes for every role in `roles`, plus `/health`.
pub fn router(roles: &[Role]) -> Router<ApiState> {
    let mut router = Router::new().route("/health", get(health_check));

    if roles.contains(&Role::Conductor) {
        router = router
            .route("/conductor/queries", post(conductor::submit_query))
            .route("/conductor/queries/{query_id}", get(conductor::get_query))
            .route(
                "/conductor/queries/{query_id}/lead",
                post(conductor::lead_query),
            )
            .route(
                "/conductor/queries/{query_id}/local-results",
                post(conductor::complete_local_query),
            )
            .route(
                "/conductor/queries/{query_id}/layers/{layer}/units/{unit}/result",
                post(conductor::record_unit_result),
            )
            .route(
                "/conductor/queries/{query_id}/layers/{layer}/units/{unit}/failure",
                post(conductor::record_unit_failure),
            )
            .route(
                "/conductor/queries/{query_id}/metadata",
                get(conductor::get_metadata),
            );
    }
    if roles.contains(&Role::Aggregator) {
        router = router.route("/aggregator/compute", post(aggregator::compute));
    }
    if roles.contains(&Role::Target) {
        router = router
            .route("/target/select", post(target::select_targets))
            .route("/target/subscribers", post(target::register_subscriber));
    }
    router
}

pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    let roles: Vec<&str> = state.roles.iter().map(|r| r.as_str()).collect();
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "conductor",
            "roles": roles,
        })),
    )
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

impl From<ConductorError> for ApiError {
    fn from(e: ConductorError) -> Self {
        let status = match &e {
            ConductorError::NotFound(_) => StatusCode::NOT_FOUND,
            ConductorError::Ambiguous(_) => StatusCode::BAD_REQUEST,
            ConductorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ConductorError::Conflict(_) => StatusCode::CONFLICT,
            ConductorError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ConductorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.code(), e.to_string())
    }
}

impl From<TargetError> for ApiError {
    fn from(e: TargetError) -> Self {
        match e {
            TargetError::Profile(ProfileError::UnknownList(_)) => {
                ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
            }
            TargetError::Profile(ProfileError::Malformed(_)) | TargetError::InvalidSubscriber(_) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED", e.to_string())
            }
            TargetError::Store(StoreError::Conflict(_)) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", e.to_string())
            }
            TargetError::Store(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string())
            }
        }
    }
}
