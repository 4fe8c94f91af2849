use chrono::Utc;
use shared_types::TaskMetadata;

use crate::actors::conductor::protocol::ConductorError;
use crate::actors::conductor::service::Conductor;
use crate::actors::conductor::state::{QueryContext, StageTimer};
use crate::store::StoreError;

impl Conductor {
    /// Record a stage outcome in the execution metadata and hand the outcome
    /// back unchanged. Metadata is observational: failing to write it is
    /// logged, never returned.
    pub(crate) async fn observe<T>(
        &self,
        ctx: &mut QueryContext,
        timer: StageTimer,
        outcome: Result<T, ConductorError>,
    ) -> Result<T, ConductorError> {
        let now = Utc::now();
        let entry = TaskMetadata {
            started_at: Some(timer.started_at),
            arrived_at: None,
            returned_at: Some(now),
            ended_at: Some(now),
            error: outcome.as_ref().err().map(ToString::to_string),
            host: Some(self.node_name.clone()),
        };

        match &outcome {
            Ok(_) => tracing::info!(
                query_id = %ctx.id(),
                stage = %timer.name,
                elapsed_ms = (now - timer.started_at).num_milliseconds(),
                "Stage completed"
            ),
            Err(e) => tracing::warn!(
                query_id = %ctx.id(),
                stage = %timer.name,
                error = %e,
                "Stage failed"
            ),
        }

        self.write_stage(ctx, &timer.name, entry).await;
        outcome
    }

    /// Record a unit the aggregator gave up on under `layer_{l}_unit_{u}`.
    pub(crate) async fn observe_unit_failure(
        &self,
        ctx: &mut QueryContext,
        layer: usize,
        unit: usize,
        reason: &str,
    ) {
        let now = Utc::now();
        let entry = TaskMetadata {
            started_at: None,
            arrived_at: None,
            returned_at: Some(now),
            ended_at: Some(now),
            error: Some(reason.to_string()),
            host: Some(self.node_name.clone()),
        };
        self.write_stage(ctx, &format!("layer_{layer}_unit_{unit}"), entry)
            .await;
    }

    /// Stamp the whole query as ended.
    pub(crate) async fn close_metadata(&self, ctx: &mut QueryContext) {
        let Some(metadata) = ctx.metadata.as_mut() else {
            return;
        };
        metadata.doc.ended_at = Some(Utc::now());
        if let Err(e) = self.metadata.update(metadata).await {
            tracing::warn!(query_id = %ctx.id(), error = %e, "Failed to close execution metadata");
        }
    }

    async fn write_stage(&self, ctx: &mut QueryContext, stage: &str, entry: TaskMetadata) {
        let query_id = ctx.id().clone();
        for attempt in 0..2 {
            let Some(metadata) = ctx.metadata.as_mut() else {
                tracing::debug!(query_id = %query_id, stage, "No execution metadata record");
                return;
            };
            metadata.doc.stages.insert(stage.to_string(), entry.clone());

            match self.metadata.update(metadata).await {
                Ok(()) => return,
                Err(StoreError::Conflict(_)) if attempt == 0 => {
                    match self.metadata.get(query_id.as_str()).await {
                        Ok(fresh) => ctx.metadata = Some(fresh),
                        Err(e) => {
                            tracing::warn!(
                                query_id = %query_id,
                                stage,
                                error = %e,
                                "Failed to reload execution metadata"
                            );
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        query_id = %query_id,
                        stage,
                        error = %e,
                        "Failed to record stage metadata"
                    );
                    return;
                }
            }
        }
    }
}
