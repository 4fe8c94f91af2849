//! Aggregator API endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use shared_types::ComputeRequest;

use crate::actors::aggregator::AggregatorMsg;
use crate::api::{ApiError, ApiState};

/// POST /aggregator/compute
pub async fn compute(
    State(state): State<ApiState>,
    Json(request): Json<ComputeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.app_state.aggregator().ok_or_else(|| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "ACTOR_NOT_AVAILABLE",
            "aggregator pool is not running",
        )
    })?;

    tracing::debug!(
        query_id = %request.query_id,
        layer = request.layer,
        unit = request.unit,
        rows = request.rows.len(),
        "Compute request received"
    );
    let ack = ractor::call!(pool, |reply| AggregatorMsg::Compute { request, reply }).map_err(
        |e| {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "ACTOR_NOT_AVAILABLE",
                e.to_string(),
            )
        },
    )?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}
