//! ConductorActor - mailbox front for the conductor entry points
//!
//! Every request is answered from its own task, so a slow lead (remote
//! calls, layer fan-out) never holds up the mailbox. The `Conductor` it
//! drives keeps no state between calls; all coordination between racing
//! requests happens in the store.
//!
//! ```text
//! Submit ──► submit ──► reply(query)
//!              └─► lead ──► LeadReturned (logged)
//! Lead / CompleteLocalQuery / RecordUnit* ──► spawn ──► reply
//! ```

use std::future::Future;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};

use crate::actors::conductor::protocol::ConductorMsg;
use crate::actors::conductor::service::Conductor;

/// ConductorActor - serves conductor requests for every query
#[derive(Debug, Default)]
pub struct ConductorActor;

pub struct ConductorArguments {
    pub conductor: Conductor,
}

pub struct ConductorActorState {
    conductor: Conductor,
}

#[async_trait]
impl Actor for ConductorActor {
    type Msg = ConductorMsg;
    type State = ConductorActorState;
    type Arguments = ConductorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "ConductorActor starting");
        Ok(ConductorActorState {
            conductor: args.conductor,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConductorMsg::Submit { submission, reply } => {
                let conductor = state.conductor.clone();
                tokio::spawn(async move {
                    let submitted = conductor.submit(submission).await;
                    let query_id = submitted.as_ref().ok().map(|q| q.id.clone());
                    let _ = reply.send(submitted);

                    if let Some(query_id) = query_id {
                        let outcome = conductor.lead(&query_id).await;
                        let _ = myself
                            .send_message(ConductorMsg::LeadReturned { query_id, outcome });
                    }
                });
            }
            ConductorMsg::GetQuery { query_id, reply } => {
                respond(state, reply, |c| async move { c.query(&query_id).await });
            }
            ConductorMsg::GetMetadata { query_id, reply } => {
                respond(state, reply, |c| async move { c.metadata(&query_id).await });
            }
            ConductorMsg::Lead { query_id, reply } => {
                respond(state, reply, |c| async move { c.lead(&query_id).await });
            }
            ConductorMsg::CompleteLocalQuery {
                query_id,
                rows,
                reply,
            } => {
                respond(state, reply, |c| async move {
                    c.complete_local_query(&query_id, rows).await
                });
            }
            ConductorMsg::RecordUnitResult {
                query_id,
                layer,
                unit,
                result,
                reply,
            } => {
                respond(state, reply, move |c| async move {
                    c.record_unit_result(&query_id, layer, unit, result).await
                });
            }
            ConductorMsg::RecordUnitFailure {
                query_id,
                layer,
                unit,
                reason,
                reply,
            } => {
                respond(state, reply, move |c| async move {
                    c.record_unit_failure(&query_id, layer, unit, &reason).await
                });
            }
            ConductorMsg::LeadReturned { query_id, outcome } => match outcome {
                Ok(outcome) => {
                    tracing::info!(query_id = %query_id, outcome = ?outcome, "Initial lead returned")
                }
                Err(e) => tracing::warn!(query_id = %query_id, error = %e, "Initial lead failed"),
            },
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "ConductorActor stopped");
        Ok(())
    }
}

/// Run `work` on its own task and send what it returns to `reply`.
fn respond<T, F, Fut>(state: &ConductorActorState, reply: RpcReplyPort<T>, work: F)
where
    T: Send + 'static,
    F: FnOnce(Conductor) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let pending = work(state.conductor.clone());
    tokio::spawn(async move {
        let _ = reply.send(pending.await);
    });
}
