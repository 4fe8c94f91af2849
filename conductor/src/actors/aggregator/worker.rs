use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use shared_types::{ComputeRequest, QueryId, Row, UnitFailureReport, UnitResultReport};

use crate::aggregation::{run_jobs, AggregationError};
use crate::remote::{RemoteActor, RemoteError, Role};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum WorkerError {
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("result report failed after {attempts} attempts: {source}")]
    Report { attempts: u32, source: RemoteError },
    #[error("worker pool is shut down")]
    PoolClosed,
}

/// Compute one unit and deliver the outcome, attempting delivery at most
/// `max_attempts` times. Aggregation errors are deterministic: the unit is
/// reported as failed instead of retried, and the error is returned once the
/// conductor has it.
pub async fn process_unit(
    remote: &dyn RemoteActor,
    request: &ComputeRequest,
    max_attempts: u32,
) -> Result<(), WorkerError> {
    match run_jobs(&request.rows, &request.jobs) {
        Ok(result) => {
            deliver(request, max_attempts, || {
                report_result(remote, &request.query_id, request.layer, request.unit, &result)
            })
            .await
        }
        Err(error) => {
            let reason = error.to_string();
            deliver(request, max_attempts, || {
                report_failure(remote, &request.query_id, request.layer, request.unit, &reason)
            })
            .await?;
            Err(WorkerError::Aggregation(error))
        }
    }
}

async fn deliver<F, Fut>(
    request: &ComputeRequest,
    max_attempts: u32,
    mut report: F,
) -> Result<(), WorkerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RemoteError>>,
{
    let mut attempt = 1;
    loop {
        match report().await {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= max_attempts => {
                return Err(WorkerError::Report {
                    attempts: attempt,
                    source,
                })
            }
            Err(e) => {
                tracing::warn!(
                    query_id = %request.query_id,
                    layer = request.layer,
                    unit = request.unit,
                    attempt,
                    error = %e,
                    "Unit report failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                attempt += 1;
            }
        }
    }
}

/// Post a unit result to the conductor. A conflict reply is retried exactly
/// once.
pub async fn report_result(
    remote: &dyn RemoteActor,
    query_id: &QueryId,
    layer: usize,
    unit: usize,
    result: &Row,
) -> Result<(), RemoteError> {
    let mode = format!("queries/{query_id}/layers/{layer}/units/{unit}/result");
    let report = UnitResultReport {
        result: result.clone(),
    };
    post_report(remote, &mode, &report).await
}

/// Tell the conductor a unit cannot be computed.
pub async fn report_failure(
    remote: &dyn RemoteActor,
    query_id: &QueryId,
    layer: usize,
    unit: usize,
    reason: &str,
) -> Result<(), RemoteError> {
    let mode = format!("queries/{query_id}/layers/{layer}/units/{unit}/failure");
    let report = UnitFailureReport {
        reason: reason.to_string(),
    };
    post_report(remote, &mode, &report).await
}

async fn post_report<T: Serialize>(
    remote: &dyn RemoteActor,
    mode: &str,
    report: &T,
) -> Result<(), RemoteError> {
    let body =
        serde_json::to_value(report).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

    match remote.call(Role::Conductor, mode, body.clone()).await {
        Err(RemoteError::Conflict(reason)) => {
            tracing::debug!(mode, %reason, "Conflict on report, retrying once");
            remote.call(Role::Conductor, mode, body).await.map(|_| ())
        }
        other => other.map(|_| ()),
    }
}
