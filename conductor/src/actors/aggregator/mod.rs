//! AggregatorActor - bounded worker pool for layer units
//!
//! Accepts one `ComputeRequest` per unit, acknowledges it immediately and
//! runs it in the background under a semaphore:
//!
//! ```text
//! Compute ──► ack(arrived_at)
//!    └─► spawn ─► permit ─► run_jobs ─┬─► report result  ─┐
//!                                     └─► report failure ─┴─► UnitFinished
//!                                 (≤ max_attempts each, 409 retried once)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (pool, _handle) = Actor::spawn(
//!     None,
//!     AggregatorActor,
//!     AggregatorArguments { remote, concurrency: 4, max_attempts: 3 },
//! ).await?;
//! let ack = ractor::call!(pool, |reply| AggregatorMsg::Compute { request, reply })?;
//! ```

mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{ComputeAck, ComputeRequest, QueryId};
use tokio::sync::Semaphore;

use crate::remote::RemoteActor;

pub use worker::{process_unit, report_failure, report_result, WorkerError};

/// Actor that owns the aggregation worker pool
#[derive(Debug, Default)]
pub struct AggregatorActor;

pub struct AggregatorArguments {
    pub remote: Arc<dyn RemoteActor>,
    /// Units computed at the same time
    pub concurrency: usize,
    /// Deliveries attempted per unit before giving up
    pub max_attempts: u32,
}

pub struct AggregatorState {
    remote: Arc<dyn RemoteActor>,
    permits: Arc<Semaphore>,
    max_attempts: u32,
    stats: AggregatorStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AggregatorStats {
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum AggregatorMsg {
    /// Queue one unit of work
    Compute {
        request: ComputeRequest,
        reply: RpcReplyPort<ComputeAck>,
    },
    /// Internal: a background unit ended
    UnitFinished {
        query_id: QueryId,
        layer: usize,
        unit: usize,
        outcome: Result<(), WorkerError>,
    },
    GetStats {
        reply: RpcReplyPort<AggregatorStats>,
    },
}

#[async_trait]
impl Actor for AggregatorActor {
    type Msg = AggregatorMsg;
    type State = AggregatorState;
    type Arguments = AggregatorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let concurrency = args.concurrency.max(1);
        tracing::info!(
            actor_id = %myself.get_id(),
            concurrency,
            max_attempts = args.max_attempts,
            "AggregatorActor starting"
        );
        Ok(AggregatorState {
            remote: args.remote,
            permits: Arc::new(Semaphore::new(concurrency)),
            max_attempts: args.max_attempts.max(1),
            stats: AggregatorStats::default(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            AggregatorMsg::Compute { request, reply } => {
                state.stats.accepted += 1;
                let _ = reply.send(ComputeAck {
                    status: "accepted".to_string(),
                    arrived_at: chrono::Utc::now(),
                });
                self.spawn_unit(myself, state, request);
            }
            AggregatorMsg::UnitFinished {
                query_id,
                layer,
                unit,
                outcome,
            } => match outcome {
                Ok(()) => {
                    state.stats.completed += 1;
                    tracing::info!(query_id = %query_id, layer, unit, "Unit completed");
                }
                Err(e) => {
                    state.stats.failed += 1;
                    tracing::error!(query_id = %query_id, layer, unit, error = %e, "Unit failed");
                }
            },
            AggregatorMsg::GetStats { reply } => {
                let _ = reply.send(state.stats);
            }
        }
        Ok(())
    }
}

impl AggregatorActor {
    fn spawn_unit(
        &self,
        myself: ActorRef<AggregatorMsg>,
        state: &AggregatorState,
        request: ComputeRequest,
    ) {
        let remote = state.remote.clone();
        let permits = state.permits.clone();
        let max_attempts = state.max_attempts;

        tokio::spawn(async move {
            let (query_id, layer, unit) = (request.query_id.clone(), request.layer, request.unit);
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => process_unit(remote.as_ref(), &request, max_attempts).await,
                Err(_) => Err(WorkerError::PoolClosed),
            };
            let _ = myself.send_message(AggregatorMsg::UnitFinished {
                query_id,
                layer,
                unit,
                outcome,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteError, Role};
    use shared_types::{AggregationJob, Row, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRemote {
        calls: Mutex<Vec<(Role, String, serde_json::Value)>>,
    }

    #[async_trait]
    impl RemoteActor for RecordingRemote {
        async fn call(
            &self,
            role: Role,
            mode: &str,
            body: serde_json::Value,
        ) -> Result<serde_json::Value, RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push((role, mode.to_string(), body));
            Ok(serde_json::json!({"status": "recorded"}))
        }
    }

    fn request(unit: usize) -> ComputeRequest {
        let rows: Vec<Row> = (1..=3)
            .map(|i| [("x".to_string(), Value::Int(i))].into_iter().collect())
            .collect();
        ComputeRequest {
            query_id: QueryId::from("q1"),
            layer: 0,
            unit,
            rows,
            jobs: vec![AggregationJob::new("sum").arg("key", "x")],
        }
    }

    async fn wait_for_completed(pool: &ActorRef<AggregatorMsg>, expected: u64) -> AggregatorStats {
        for _ in 0..100 {
            let stats = ractor::call!(pool, |reply| AggregatorMsg::GetStats { reply }).unwrap();
            if stats.completed + stats.failed >= expected {
                return stats;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("units did not finish in time");
    }

    #[tokio::test]
    async fn test_compute_acks_and_reports_each_unit() {
        let remote = Arc::new(RecordingRemote::default());
        let (pool, handle) = Actor::spawn(
            None,
            AggregatorActor,
            AggregatorArguments {
                remote: remote.clone(),
                concurrency: 2,
                max_attempts: 3,
            },
        )
        .await
        .unwrap();

        for unit in 0..3 {
            let ack = ractor::call!(pool, |reply| AggregatorMsg::Compute {
                request: request(unit),
                reply,
            })
            .unwrap();
            assert_eq!(ack.status, "accepted");
        }

        let stats = wait_for_completed(&pool, 3).await;
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 0);

        let mut modes: Vec<String> = remote
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(role, mode, body)| {
                assert_eq!(*role, Role::Conductor);
                assert_eq!(body["result"]["sum_x"], serde_json::json!(6.0));
                mode.clone()
            })
            .collect();
        modes.sort();
        assert_eq!(
            modes,
            vec![
                "queries/q1/layers/0/units/0/result",
                "queries/q1/layers/0/units/1/result",
                "queries/q1/layers/0/units/2/result",
            ]
        );

        pool.stop(None);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_function_fails_the_unit_and_tells_the_conductor() {
        let remote = Arc::new(RecordingRemote::default());
        let (pool, handle) = Actor::spawn(
            None,
            AggregatorActor,
            AggregatorArguments {
                remote: remote.clone(),
                concurrency: 1,
                max_attempts: 3,
            },
        )
        .await
        .unwrap();

        let mut bad = request(0);
        bad.jobs = vec![AggregationJob::new("median")];
        ractor::call!(pool, |reply| AggregatorMsg::Compute {
            request: bad,
            reply,
        })
        .unwrap();

        let stats = wait_for_completed(&pool, 1).await;
        assert_eq!(stats.failed, 1);
        let calls = remote.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        let (role, mode, body) = &calls[0];
        assert_eq!(*role, Role::Conductor);
        assert_eq!(mode, "queries/q1/layers/0/units/0/failure");
        assert!(body["reason"].as_str().unwrap().contains("median"));

        pool.stop(None);
        handle.await.unwrap();
    }
}
