use shared_types::{Checkpoint, TaskState};

use crate::actors::conductor::protocol::ConductorError;
use crate::actors::conductor::service::Conductor;
use crate::actors::conductor::state::{QueryContext, StageTimer};

impl Conductor {
    /// Store the last layer's single result once every layer is finished.
    /// Returns whether the query is now complete.
    pub(crate) async fn try_finish(&self, ctx: &mut QueryContext) -> Result<bool, ConductorError> {
        for layer in 0..ctx.layer_count() {
            let state = self
                .tasks
                .layer_state(ctx.id(), layer, ctx.layer_size(layer))
                .await?;
            if state != TaskState::Finished {
                return Ok(false);
            }
        }
        let Some(last) = ctx.layer_count().checked_sub(1) else {
            return Ok(false);
        };

        let timer = StageTimer::start("finish");
        let outcome = self.store_final_result(ctx, last).await;
        self.observe(ctx, timer, outcome).await?;
        self.close_metadata(ctx).await;

        tracing::info!(query_id = %ctx.id(), "Query finished");
        Ok(true)
    }

    async fn store_final_result(
        &self,
        ctx: &mut QueryContext,
        last: usize,
    ) -> Result<(), ConductorError> {
        let result = self.tasks.fetch_result(ctx.id(), last, 0).await?;
        ctx.query.doc.results = Some(result);
        ctx.query.doc.checkpoints.mark(Checkpoint::AggregationCompleted);
        self.persist(ctx).await
    }
}
