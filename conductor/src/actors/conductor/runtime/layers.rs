use shared_types::{ComputeAck, ComputeRequest, Row, TaskState};

use crate::actors::conductor::protocol::ConductorError;
use crate::actors::conductor::service::Conductor;
use crate::actors::conductor::state::{
    fold_boundaries, fold_rng, should_run, shuffle_rows, QueryContext, StageTimer,
    MIN_LAYER0_ROWS,
};
use crate::remote::{call_json, Role};
use crate::store::StoreError;
use crate::tasks::{derive_layer_state, pending_units};

impl Conductor {
    /// Stage `da`: advance the cursor over finished layers and dispatch the
    /// first one that is ready. At most one layer is in flight per call.
    ///
    /// A layer that is in flight but has units with no record or a `Failed`
    /// record gets those units sent again.
    pub(crate) async fn layered_aggregation(
        &self,
        ctx: &mut QueryContext,
    ) -> Result<Option<usize>, ConductorError> {
        while ctx.cursor < ctx.layer_count() {
            let layer = ctx.cursor;
            let size = ctx.layer_size(layer);
            let records = self.tasks.layer_tasks(ctx.id(), layer).await?;
            let current = derive_layer_state(&records, size);
            if current == TaskState::Finished {
                ctx.cursor += 1;
                continue;
            }

            let previous = match layer {
                0 => None,
                _ => Some(
                    self.tasks
                        .layer_state(ctx.id(), layer - 1, ctx.layer_size(layer - 1))
                        .await?,
                ),
            };
            let units: Vec<usize> = match current {
                TaskState::Waiting if should_run(layer, ctx.layer_count(), current, previous) => {
                    (0..size).collect()
                }
                TaskState::Running | TaskState::Failed
                    if layer == 0 || previous == Some(TaskState::Finished) =>
                {
                    pending_units(&records, size)
                }
                _ => Vec::new(),
            };
            if units.is_empty() {
                tracing::debug!(query_id = %ctx.id(), layer, state = %current, "Layer not finished");
                return Ok(None);
            }

            if current != TaskState::Waiting {
                tracing::info!(query_id = %ctx.id(), layer, units = ?units, "Resuming layer");
            }
            let timer = StageTimer::start(format!("layer_{layer}"));
            let outcome = self.dispatch_layer(ctx, layer, &units).await;
            self.observe(ctx, timer, outcome).await?;
            return Ok(Some(layer));
        }
        Ok(None)
    }

    async fn layer_input(&self, ctx: &QueryContext, layer: usize) -> Result<Vec<Row>, ConductorError> {
        if layer == 0 {
            let rows = ctx
                .query
                .doc
                .layers
                .first()
                .map(|l| l.data.clone())
                .unwrap_or_default();
            if rows.len() < MIN_LAYER0_ROWS {
                return Err(ConductorError::Validation(format!(
                    "not enough data: {} rows, at least {MIN_LAYER0_ROWS} required",
                    rows.len()
                )));
            }
            return Ok(rows);
        }
        Ok(self.tasks.layer_results(ctx.id(), layer - 1).await?)
    }

    /// Shard a layer's input into `size` folds and send the given units.
    /// Folds depend only on the query and layer, so units sent in separate
    /// calls still partition the input.
    pub(crate) async fn dispatch_layer(
        &self,
        ctx: &mut QueryContext,
        layer: usize,
        units: &[usize],
    ) -> Result<(), ConductorError> {
        let mut rows = self.layer_input(ctx, layer).await?;
        if rows.is_empty() {
            return Err(ConductorError::Validation(format!(
                "layer {layer} has no input rows"
            )));
        }
        shuffle_rows(&mut rows, &mut fold_rng(ctx.id(), layer));

        let size = ctx.layer_size(layer);
        let jobs = ctx.query.doc.layers[layer].jobs.clone();
        let bounds = fold_boundaries(rows.len(), size);

        for &unit in units {
            self.tasks.clear_failed(ctx.id(), layer, unit).await?;
            let record = match self.tasks.create(ctx.id(), layer, unit).await {
                Ok(record) => record,
                Err(StoreError::AlreadyExists(_)) => {
                    tracing::info!(
                        query_id = %ctx.id(),
                        layer,
                        unit,
                        "Layer already dispatched by another caller"
                    );
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let request = ComputeRequest {
                query_id: ctx.id().clone(),
                layer,
                unit,
                rows: rows[bounds[unit]..bounds[unit + 1]].to_vec(),
                jobs: jobs.clone(),
            };
            let ack: ComputeAck =
                match call_json(self.remote.as_ref(), Role::Aggregator, "compute", &request).await
                {
                    Ok(ack) => ack,
                    Err(e) => {
                        // Free the unit for the next lead.
                        if let Err(discard) = self.tasks.discard(record).await {
                            tracing::warn!(
                                query_id = %ctx.id(),
                                layer,
                                unit,
                                error = %discard,
                                "Failed to discard undelivered unit"
                            );
                        }
                        return Err(e.into());
                    }
                };
            tracing::info!(
                query_id = %ctx.id(),
                layer,
                unit,
                rows = request.rows.len(),
                arrived_at = %ack.arrived_at,
                "Unit dispatched"
            );
        }

        match self.persist(ctx).await {
            // A fast unit can finish the query before the dispatcher writes back.
            Err(ConductorError::Conflict(_)) => {
                tracing::debug!(query_id = %ctx.id(), layer, "Query moved on during dispatch");
                Ok(())
            }
            other => other,
        }
    }
}
