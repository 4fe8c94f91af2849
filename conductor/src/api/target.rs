//! Target API endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use shared_types::{SelectTargetsRequest, Subscriber};

use crate::api::{ApiError, ApiState};

/// POST /target/select
pub async fn select_targets(
    State(state): State<ApiState>,
    Json(request): Json<SelectTargetsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.app_state.target().select(&request)?))
}

/// POST /target/subscribers
pub async fn register_subscriber(
    State(state): State<ApiState>,
    Json(subscriber): Json<Subscriber>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.app_state.target().register(subscriber).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}
