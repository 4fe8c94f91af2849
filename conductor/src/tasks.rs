//! Async task store
//!
//! Persisted records of dispatched units of work, keyed by
//! `(query, layer, unit)`. The document id is derived from that triple, so the
//! store's insert-if-absent is what guarantees at most one record per unit.
//!
//! Layer state is derived from the per-unit records, never stored:
//!
//! ```text
//! no records                      → Waiting
//! any record Failed               → Failed
//! fewer records than expected     → Running
//! all records, one not Finished   → Running
//! all records Finished            → Finished
//! ```
//!
//! A `Failed` unit, or a unit with no record in a `Running` layer, is
//! pending: the next dispatch of the layer sends it again.

use std::sync::Arc;

use shared_types::{AsyncTask, QueryId, Row, TaskMetadata, TaskState, TaskType};

use crate::store::{
    Collection, DocumentStore, Namespace, Selector, StoreError, Versioned, ASYNC_TASKS_TABLE,
};

#[derive(Clone)]
pub struct AsyncTaskStore {
    tasks: Collection<AsyncTask>,
}

impl AsyncTaskStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            tasks: Collection::new(store, Namespace::Conductor, ASYNC_TASKS_TABLE),
        }
    }

    pub async fn exists(
        &self,
        query_id: &QueryId,
        layer: usize,
        unit: usize,
    ) -> Result<bool, StoreError> {
        match self.get(query_id, layer, unit).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the `Running` record for a unit. Fails with
    /// [`StoreError::AlreadyExists`] if any caller created it first.
    pub async fn create(
        &self,
        query_id: &QueryId,
        layer: usize,
        unit: usize,
    ) -> Result<Versioned<AsyncTask>, StoreError> {
        let id = AsyncTask::aggregation_id(query_id, layer, unit);
        let task = running_task(id.clone(), TaskType::Aggregation, query_id, layer, unit);
        self.tasks.create(&id, task).await
    }

    pub async fn create_query_target(
        &self,
        query_id: &QueryId,
    ) -> Result<Versioned<AsyncTask>, StoreError> {
        let id = AsyncTask::query_target_id(query_id);
        let task = running_task(id.clone(), TaskType::QueryTarget, query_id, 0, 0);
        self.tasks.create(&id, task).await
    }

    pub async fn get_query_target(
        &self,
        query_id: &QueryId,
    ) -> Result<Versioned<AsyncTask>, StoreError> {
        self.tasks.get(&AsyncTask::query_target_id(query_id)).await
    }

    /// Drop a record whose dispatch never reached the remote side, so a later
    /// attempt can create it again.
    pub async fn discard(&self, record: Versioned<AsyncTask>) -> Result<(), StoreError> {
        self.tasks.delete(record).await
    }

    pub async fn get(
        &self,
        query_id: &QueryId,
        layer: usize,
        unit: usize,
    ) -> Result<Versioned<AsyncTask>, StoreError> {
        self.tasks
            .get(&AsyncTask::aggregation_id(query_id, layer, unit))
            .await
    }

    /// Mark a unit `Finished` with its payload. A record that is already
    /// finished is left untouched.
    pub async fn record_result(
        &self,
        record: &mut Versioned<AsyncTask>,
        payload: Row,
    ) -> Result<(), StoreError> {
        if record.doc.state == TaskState::Finished {
            tracing::debug!(task_id = %record.id, "Result already recorded");
            return Ok(());
        }

        record.doc.state = TaskState::Finished;
        record.doc.result = payload;
        record.doc.metadata.ended_at = Some(chrono::Utc::now());
        self.tasks.update(record).await
    }

    /// Mark a unit `Failed` with the worker's reason. A record that already
    /// finished or failed is left untouched.
    pub async fn record_failure(
        &self,
        record: &mut Versioned<AsyncTask>,
        reason: &str,
    ) -> Result<(), StoreError> {
        if matches!(record.doc.state, TaskState::Finished | TaskState::Failed) {
            tracing::debug!(task_id = %record.id, state = %record.doc.state, "Unit already settled");
            return Ok(());
        }

        record.doc.state = TaskState::Failed;
        record.doc.metadata.error = Some(reason.to_string());
        record.doc.metadata.ended_at = Some(chrono::Utc::now());
        self.tasks.update(record).await
    }

    /// Remove a `Failed` record so the unit can be created again. Another
    /// caller removing or replacing it first is not an error.
    pub async fn clear_failed(
        &self,
        query_id: &QueryId,
        layer: usize,
        unit: usize,
    ) -> Result<(), StoreError> {
        let record = match self.get(query_id, layer, unit).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if record.doc.state != TaskState::Failed {
            return Ok(());
        }
        match self.tasks.delete(record).await {
            Ok(()) | Err(StoreError::NotFound(_)) | Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every aggregation record of one layer, ordered by unit index.
    pub async fn layer_tasks(
        &self,
        query_id: &QueryId,
        layer: usize,
    ) -> Result<Vec<AsyncTask>, StoreError> {
        let selector = Selector::new()
            .eq("query_id", query_id)?
            .eq("layer", layer)?
            .eq("kind", TaskType::Aggregation)?;
        let mut tasks: Vec<AsyncTask> = self
            .tasks
            .find(&selector)
            .await?
            .into_iter()
            .map(|v| v.doc)
            .collect();
        tasks.sort_by_key(|t| t.unit);
        Ok(tasks)
    }

    pub async fn layer_state(
        &self,
        query_id: &QueryId,
        layer: usize,
        expected_size: usize,
    ) -> Result<TaskState, StoreError> {
        let tasks = self.layer_tasks(query_id, layer).await?;
        Ok(derive_layer_state(&tasks, expected_size))
    }

    pub async fn fetch_result(
        &self,
        query_id: &QueryId,
        layer: usize,
        unit: usize,
    ) -> Result<Row, StoreError> {
        Ok(self.get(query_id, layer, unit).await?.doc.result)
    }

    /// Results of every finished unit of a layer, in unit-index order.
    pub async fn layer_results(
        &self,
        query_id: &QueryId,
        layer: usize,
    ) -> Result<Vec<Row>, StoreError> {
        Ok(self
            .layer_tasks(query_id, layer)
            .await?
            .into_iter()
            .filter(|t| t.state == TaskState::Finished)
            .map(|t| t.result)
            .collect())
    }
}

fn running_task(
    id: String,
    kind: TaskType,
    query_id: &QueryId,
    layer: usize,
    unit: usize,
) -> AsyncTask {
    AsyncTask {
        id,
        kind,
        query_id: query_id.clone(),
        layer,
        unit,
        state: TaskState::Running,
        result: Row::new(),
        metadata: TaskMetadata {
            started_at: Some(chrono::Utc::now()),
            ..TaskMetadata::default()
        },
    }
}

pub fn derive_layer_state(tasks: &[AsyncTask], expected_size: usize) -> TaskState {
    if tasks.is_empty() {
        TaskState::Waiting
    } else if tasks.iter().any(|t| t.state == TaskState::Failed) {
        TaskState::Failed
    } else if tasks.len() < expected_size {
        TaskState::Running
    } else if tasks.iter().all(|t| t.state == TaskState::Finished) {
        TaskState::Finished
    } else {
        TaskState::Running
    }
}

/// Units of a layer that have no record or whose record failed, in unit
/// order. `tasks` must be the layer's records as returned by
/// [`AsyncTaskStore::layer_tasks`].
pub fn pending_units(tasks: &[AsyncTask], expected_size: usize) -> Vec<usize> {
    (0..expected_size)
        .filter(|unit| {
            tasks
                .iter()
                .find(|t| t.unit == *unit)
                .map_or(true, |t| t.state == TaskState::Failed)
        })
        .collect()
}
