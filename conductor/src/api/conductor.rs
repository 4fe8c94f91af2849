//! Conductor API endpoints
//!
//! Every handler is one `call!` to the ConductorActor. Submission replies as
//! soon as the query is stored and the actor leads it in the background. The
//! callbacks (local-query results, unit results and unit failures) re-enter
//! the state machine before replying, so a conflict surfaces as 409 to the
//! caller.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use shared_types::{
    LocalQueryResults, QueryId, QuerySubmission, UnitFailureReport, UnitResultReport,
};

use crate::actors::conductor::{ConductorMsg, LeadOutcome, LocalResultsOutcome};
use crate::api::{ApiError, ApiState};

fn outcome_json(outcome: &LeadOutcome) -> serde_json::Value {
    match outcome {
        LeadOutcome::AwaitingLocalQuery => json!({"status": "awaiting_local_query"}),
        LeadOutcome::LayerDispatched(layer) => json!({"status": "layer_dispatched", "layer": layer}),
        LeadOutcome::AwaitingLayer => json!({"status": "awaiting_layer"}),
        LeadOutcome::Finished => json!({"status": "finished"}),
    }
}

fn actor_unavailable(e: impl std::fmt::Display) -> ApiError {
    ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "ACTOR_NOT_AVAILABLE",
        e.to_string(),
    )
}

/// POST /conductor/queries
pub async fn submit_query(
    State(state): State<ApiState>,
    Json(submission): Json<QuerySubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let conductor = state.app_state.conductor();
    let query = ractor::call!(conductor, |reply| ConductorMsg::Submit { submission, reply })
        .map_err(actor_unavailable)??;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "query_id": query.id,
            "status": "submitted",
        })),
    ))
}

/// GET /conductor/queries/{query_id}
pub async fn get_query(
    State(state): State<ApiState>,
    Path(query_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conductor = state.app_state.conductor();
    let query = ractor::call!(conductor, |reply| ConductorMsg::GetQuery {
        query_id: QueryId(query_id),
        reply,
    })
    .map_err(actor_unavailable)??;
    Ok(Json(query))
}

/// POST /conductor/queries/{query_id}/lead
pub async fn lead_query(
    State(state): State<ApiState>,
    Path(query_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conductor = state.app_state.conductor();
    let outcome = ractor::call!(conductor, |reply| ConductorMsg::Lead {
        query_id: QueryId(query_id),
        reply,
    })
    .map_err(actor_unavailable)??;
    Ok(Json(outcome_json(&outcome)))
}

/// POST /conductor/queries/{query_id}/local-results
pub async fn complete_local_query(
    State(state): State<ApiState>,
    Path(query_id): Path<String>,
    Json(results): Json<LocalQueryResults>,
) -> Result<impl IntoResponse, ApiError> {
    let conductor = state.app_state.conductor();
    let outcome = ractor::call!(conductor, |reply| ConductorMsg::CompleteLocalQuery {
        query_id: QueryId(query_id),
        rows: results.rows,
        reply,
    })
    .map_err(actor_unavailable)??;
    let body = match outcome {
        LocalResultsOutcome::Accepted { rows, lead } => json!({
            "status": "accepted",
            "rows": rows,
            "lead": outcome_json(&lead),
        }),
        LocalResultsOutcome::AlreadyCompleted => json!({"status": "already_completed"}),
    };
    Ok(Json(body))
}

/// POST /conductor/queries/{query_id}/layers/{layer}/units/{unit}/result
pub async fn record_unit_result(
    State(state): State<ApiState>,
    Path((query_id, layer, unit)): Path<(String, usize, usize)>,
    Json(report): Json<UnitResultReport>,
) -> Result<impl IntoResponse, ApiError> {
    let conductor = state.app_state.conductor();
    let outcome = ractor::call!(conductor, |reply| ConductorMsg::RecordUnitResult {
        query_id: QueryId(query_id),
        layer,
        unit,
        result: report.result,
        reply,
    })
    .map_err(actor_unavailable)??;
    Ok(Json(json!({
        "status": "recorded",
        "lead": outcome_json(&outcome),
    })))
}

/// POST /conductor/queries/{query_id}/layers/{layer}/units/{unit}/failure
///
/// The reply body never echoes the reason.
pub async fn record_unit_failure(
    State(state): State<ApiState>,
    Path((query_id, layer, unit)): Path<(String, usize, usize)>,
    Json(report): Json<UnitFailureReport>,
) -> Result<impl IntoResponse, ApiError> {
    let conductor = state.app_state.conductor();
    ractor::call!(conductor, |reply| ConductorMsg::RecordUnitFailure {
        query_id: QueryId(query_id),
        layer,
        unit,
        reason: report.reason,
        reply,
    })
    .map_err(actor_unavailable)??;
    Ok(Json(json!({"status": "failure_recorded"})))
}

/// GET /conductor/queries/{query_id}/metadata
pub async fn get_metadata(
    State(state): State<ApiState>,
    Path(query_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conductor = state.app_state.conductor();
    let metadata = ractor::call!(conductor, |reply| ConductorMsg::GetMetadata {
        query_id: QueryId(query_id),
        reply,
    })
    .map_err(actor_unavailable)??;
    Ok(Json(metadata))
}
