//! Conductor entry points
//!
//! Every public operation loads what it needs from the store, does its work
//! and writes back with compare-and-set. Nothing is cached between calls, so
//! any number of conductor instances may serve the same query.

use std::sync::Arc;

use shared_types::{
    AsyncTask, Blob, Checkpoint, Checkpoints, ExecutionMetadata, Query, QueryId, QuerySubmission,
    Row, Subscriber, TaskState,
};

use crate::actors::conductor::protocol::{ConductorError, LeadOutcome, LocalResultsOutcome};
use crate::actors::conductor::state::QueryContext;
use crate::aggregation;
use crate::remote::RemoteActor;
use crate::store::{
    Collection, DocumentStore, Namespace, StoreError, EXECUTION_METADATA_TABLE, QUERIES_TABLE,
    SUBSCRIBERS_TABLE,
};
use crate::tasks::AsyncTaskStore;

#[derive(Clone)]
pub struct Conductor {
    pub(crate) queries: Collection<Query>,
    pub(crate) metadata: Collection<ExecutionMetadata>,
    pub(crate) subscribers: Collection<Subscriber>,
    pub(crate) tasks: AsyncTaskStore,
    pub(crate) remote: Arc<dyn RemoteActor>,
    pub(crate) node_name: String,
}

impl Conductor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        remote: Arc<dyn RemoteActor>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            queries: Collection::new(store.clone(), Namespace::Conductor, QUERIES_TABLE),
            metadata: Collection::new(
                store.clone(),
                Namespace::Conductor,
                EXECUTION_METADATA_TABLE,
            ),
            subscribers: Collection::new(store.clone(), Namespace::Target, SUBSCRIBERS_TABLE),
            tasks: AsyncTaskStore::new(store),
            remote,
            node_name: node_name.into(),
        }
    }

    pub fn tasks(&self) -> &AsyncTaskStore {
        &self.tasks
    }

    /// Validate and persist a new query. Does not start it.
    pub async fn submit(&self, submission: QuerySubmission) -> Result<Query, ConductorError> {
        validate_submission(&submission)?;

        let id = QueryId::new();
        let query = Query {
            id: id.clone(),
            checkpoints: Checkpoints::new(),
            layers: submission.layers,
            encrypted_concepts: Blob::from_json(&submission.concepts)?,
            encrypted_lists_of_addresses: Blob::default(),
            encrypted_local_query: Blob::from_json(&submission.local_query)?,
            encrypted_target_profile: Blob::from_json(&submission.target_profile)?,
            encrypted_targets: Blob::default(),
            results: None,
            created_at: chrono::Utc::now(),
        };

        let created = self.queries.create(id.as_str(), query).await?;
        self.metadata
            .create(id.as_str(), ExecutionMetadata::new(id.clone()))
            .await?;

        tracing::info!(
            query_id = %id,
            layers = created.doc.layers.len(),
            "Query submitted"
        );
        Ok(created.doc)
    }

    pub async fn query(&self, id: &QueryId) -> Result<Query, ConductorError> {
        Ok(self.queries.get(id.as_str()).await?.doc)
    }

    pub async fn metadata(&self, id: &QueryId) -> Result<ExecutionMetadata, ConductorError> {
        Ok(self.metadata.get(id.as_str()).await?.doc)
    }

    /// Walk the checkpoint state machine as far as it can go right now.
    ///
    /// Safe to call any number of times, from any number of racing triggers:
    /// completed stages are skipped and layer fan-out is guarded by the task
    /// store.
    pub async fn lead(&self, id: &QueryId) -> Result<LeadOutcome, ConductorError> {
        let mut ctx = self.load_context(id).await?;

        if ctx.is_set(Checkpoint::AggregationCompleted) {
            return Ok(LeadOutcome::Finished);
        }
        if !ctx.is_set(Checkpoint::ConceptsResolved) {
            self.decrypt_concepts(&mut ctx).await?;
        }
        if !ctx.is_set(Checkpoint::AddressListsFetched) {
            self.fetch_address_lists(&mut ctx).await?;
        }
        if !ctx.is_set(Checkpoint::TargetsSelected) {
            self.select_targets(&mut ctx).await?;
        }
        if !ctx.is_set(Checkpoint::LocalQueryCompleted) {
            self.dispatch_local_query(&mut ctx).await?;
            return Ok(LeadOutcome::AwaitingLocalQuery);
        }

        if let Some(layer) = self.layered_aggregation(&mut ctx).await? {
            return Ok(LeadOutcome::LayerDispatched(layer));
        }
        if self.try_finish(&mut ctx).await? {
            return Ok(LeadOutcome::Finished);
        }
        Ok(LeadOutcome::AwaitingLayer)
    }

    /// Inbound completion of the local query: installs the layer-0 rows,
    /// sets `t` and resumes.
    pub async fn complete_local_query(
        &self,
        id: &QueryId,
        rows: Vec<Row>,
    ) -> Result<LocalResultsOutcome, ConductorError> {
        let mut query = self.queries.get(id.as_str()).await?;
        if query.doc.checkpoints.is_set(Checkpoint::LocalQueryCompleted) {
            tracing::debug!(query_id = %id, "Local query results already installed");
            return Ok(LocalResultsOutcome::AlreadyCompleted);
        }

        let count = rows.len();
        let first = query
            .doc
            .layers
            .first_mut()
            .ok_or_else(|| ConductorError::Validation("query has no layers".to_string()))?;
        first.data = rows;
        query.doc.checkpoints.mark(Checkpoint::LocalQueryCompleted);
        self.queries.update(&mut query).await?;

        self.finish_query_target(id, count).await?;
        tracing::info!(query_id = %id, rows = count, "Local query results installed");

        let lead = self.lead(id).await?;
        Ok(LocalResultsOutcome::Accepted { rows: count, lead })
    }

    /// Worker callback: store one unit's result, then resume.
    pub async fn record_unit_result(
        &self,
        id: &QueryId,
        layer: usize,
        unit: usize,
        result: Row,
    ) -> Result<LeadOutcome, ConductorError> {
        let mut record = match self.tasks.get(id, layer, unit).await {
            Err(StoreError::NotFound(_)) => {
                return Err(ConductorError::NotFound(AsyncTask::aggregation_id(
                    id, layer, unit,
                )))
            }
            other => other?,
        };
        self.tasks.record_result(&mut record, result).await?;
        tracing::info!(query_id = %id, layer, unit, "Unit result recorded");

        self.lead(id).await
    }

    /// Worker callback: the unit's jobs could not be computed. Marks the
    /// record `Failed` without resuming; the next lead sends the unit again.
    pub async fn record_unit_failure(
        &self,
        id: &QueryId,
        layer: usize,
        unit: usize,
        reason: &str,
    ) -> Result<(), ConductorError> {
        let mut record = match self.tasks.get(id, layer, unit).await {
            Err(StoreError::NotFound(_)) => {
                return Err(ConductorError::NotFound(AsyncTask::aggregation_id(
                    id, layer, unit,
                )))
            }
            other => other?,
        };
        if record.doc.state != TaskState::Running {
            tracing::debug!(query_id = %id, layer, unit, state = %record.doc.state, "Unit already settled");
            return Ok(());
        }
        self.tasks.record_failure(&mut record, reason).await?;
        tracing::warn!(query_id = %id, layer, unit, reason, "Unit failed");

        let mut ctx = self.load_context(id).await?;
        self.observe_unit_failure(&mut ctx, layer, unit, reason).await;
        Ok(())
    }

    pub(crate) async fn load_context(&self, id: &QueryId) -> Result<QueryContext, ConductorError> {
        let query = self.queries.get(id.as_str()).await?;
        let metadata = match self.metadata.get(id.as_str()).await {
            Ok(metadata) => Some(metadata),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(QueryContext::new(query, metadata))
    }

    /// Write the query record back and bump the context's revision.
    pub(crate) async fn persist(&self, ctx: &mut QueryContext) -> Result<(), ConductorError> {
        self.queries.update(&mut ctx.query).await?;
        Ok(())
    }

    async fn finish_query_target(&self, id: &QueryId, rows: usize) -> Result<(), ConductorError> {
        let mut record = match self.tasks.get_query_target(id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(query_id = %id, "No query-target record to finish");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut payload = Row::new();
        payload.insert("rows".to_string(), (rows as i64).into());
        self.tasks.record_result(&mut record, payload).await?;
        Ok(())
    }
}

fn validate_submission(submission: &QuerySubmission) -> Result<(), ConductorError> {
    if submission.concepts.is_empty() {
        return Err(ConductorError::Validation(
            "at least one concept is required".to_string(),
        ));
    }
    let last = submission
        .layers
        .last()
        .ok_or_else(|| ConductorError::Validation("at least one layer is required".to_string()))?;
    if last.size != 1 {
        return Err(ConductorError::Validation(format!(
            "last layer must have size 1, found {}",
            last.size
        )));
    }
    for (index, layer) in submission.layers.iter().enumerate() {
        if layer.size == 0 {
            return Err(ConductorError::Validation(format!(
                "layer {index} has size 0"
            )));
        }
        if layer.jobs.is_empty() {
            return Err(ConductorError::Validation(format!(
                "layer {index} has no jobs"
            )));
        }
        if let Some(job) = layer
            .jobs
            .iter()
            .find(|job| aggregation::lookup(&job.function).is_none())
        {
            return Err(ConductorError::Validation(format!(
                "layer {index}: unknown aggregation function {}",
                job.function
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{AggregationJob, Layer, TargetProfile};

    fn submission(layers: Vec<Layer>) -> QuerySubmission {
        QuerySubmission {
            concepts: vec!["cooking".into()],
            target_profile: TargetProfile::single("cooking"),
            local_query: serde_json::json!({"select": "*"}),
            layers,
        }
    }

    fn layer(size: usize, function: &str) -> Layer {
        Layer {
            size,
            jobs: vec![AggregationJob::new(function).arg("key", "x")],
            data: Vec::new(),
        }
    }

    #[test]
    fn test_valid_submission() {
        assert!(validate_submission(&submission(vec![layer(3, "sum"), layer(1, "sum")])).is_ok());
    }

    #[test]
    fn test_last_layer_must_be_single() {
        let err = validate_submission(&submission(vec![layer(2, "sum")])).unwrap_err();
        assert!(matches!(err, ConductorError::Validation(ref m) if m.contains("size 1")));
    }

    #[test]
    fn test_unknown_function_is_rejected_up_front() {
        let err =
            validate_submission(&submission(vec![layer(2, "median"), layer(1, "sum")])).unwrap_err();
        assert!(matches!(err, ConductorError::Validation(ref m) if m.contains("median")));
    }

    #[test]
    fn test_empty_layers_and_zero_size() {
        assert!(validate_submission(&submission(vec![])).is_err());
        assert!(validate_submission(&submission(vec![layer(0, "sum"), layer(1, "sum")])).is_err());
    }
}
