//! Per-query working state and the pure layer-scheduling rules

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shared_types::{Checkpoint, ExecutionMetadata, Query, QueryId, Row, TaskState};

use crate::store::Versioned;

/// Layer 0 refuses to run on fewer literal rows than this.
pub const MIN_LAYER0_ROWS: usize = 50;

/// Everything one `lead` call works on. Built fresh for every call and
/// dropped at the end of it.
pub struct QueryContext {
    pub query: Versioned<Query>,
    pub metadata: Option<Versioned<ExecutionMetadata>>,
    /// First layer index not yet known to be finished.
    pub cursor: usize,
}

impl QueryContext {
    pub fn new(query: Versioned<Query>, metadata: Option<Versioned<ExecutionMetadata>>) -> Self {
        Self {
            query,
            metadata,
            cursor: 0,
        }
    }

    pub fn id(&self) -> &QueryId {
        &self.query.doc.id
    }

    pub fn is_set(&self, checkpoint: Checkpoint) -> bool {
        self.query.doc.checkpoints.is_set(checkpoint)
    }

    pub fn layer_count(&self) -> usize {
        self.query.doc.layers.len()
    }

    pub fn layer_size(&self, layer: usize) -> usize {
        self.query.doc.layers.get(layer).map_or(0, |l| l.size)
    }
}

/// Timing for one stage, filled in as the stage progresses.
#[derive(Debug, Clone)]
pub struct StageTimer {
    pub name: String,
    pub started_at: DateTime<Utc>,
}

impl StageTimer {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
        }
    }
}

/// Whether layer `layer` should be dispatched now.
///
/// `current` is the derived state of the layer itself, `previous` that of
/// layer `layer - 1` (ignored for layer 0).
pub fn should_run(
    layer: usize,
    layer_count: usize,
    current: TaskState,
    previous: Option<TaskState>,
) -> bool {
    if layer >= layer_count || current != TaskState::Waiting {
        return false;
    }
    layer == 0 || previous == Some(TaskState::Finished)
}

/// `size + 1` boundaries splitting `total` rows into `size` contiguous folds.
/// The last fold absorbs the remainder.
pub fn fold_boundaries(total: usize, size: usize) -> Vec<usize> {
    if size <= 1 {
        return vec![0, total];
    }
    let step = total / size;
    let mut bounds: Vec<usize> = (0..size).map(|k| step * k).collect();
    bounds.push(total);
    bounds
}

/// Shuffle source for one layer of one query. The same query and layer always
/// give the same folds, so a partial dispatch can be resumed unit by unit.
pub fn fold_rng(query_id: &QueryId, layer: usize) -> StdRng {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    let seed = query_id
        .as_str()
        .bytes()
        .chain((layer as u64).to_le_bytes())
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });
    StdRng::seed_from_u64(seed)
}

/// Uniform in-place shuffle.
pub fn shuffle_rows<R: Rng + ?Sized>(rows: &mut [Row], rng: &mut R) {
    rows.shuffle(rng);
}
