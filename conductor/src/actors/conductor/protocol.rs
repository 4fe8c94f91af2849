//! ConductorActor messages, error taxonomy and call outcomes

use ractor::RpcReplyPort;
use shared_types::{ExecutionMetadata, Query, QueryId, QuerySubmission, Row};

use crate::aggregation::AggregationError;
use crate::profile::ProfileError;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Messages handled by ConductorActor
#[derive(Debug)]
pub enum ConductorMsg {
    /// Persist a new query, reply, then lead it in the background
    Submit {
        submission: QuerySubmission,
        reply: RpcReplyPort<Result<Query, ConductorError>>,
    },
    GetQuery {
        query_id: QueryId,
        reply: RpcReplyPort<Result<Query, ConductorError>>,
    },
    GetMetadata {
        query_id: QueryId,
        reply: RpcReplyPort<Result<ExecutionMetadata, ConductorError>>,
    },
    /// Walk the query's stages as far as they go now
    Lead {
        query_id: QueryId,
        reply: RpcReplyPort<Result<LeadOutcome, ConductorError>>,
    },
    /// Layer-0 rows from the data-retrieval role
    CompleteLocalQuery {
        query_id: QueryId,
        rows: Vec<Row>,
        reply: RpcReplyPort<Result<LocalResultsOutcome, ConductorError>>,
    },
    /// Worker callback with a computed unit
    RecordUnitResult {
        query_id: QueryId,
        layer: usize,
        unit: usize,
        result: Row,
        reply: RpcReplyPort<Result<LeadOutcome, ConductorError>>,
    },
    /// Worker callback for a unit whose jobs could not be computed
    RecordUnitFailure {
        query_id: QueryId,
        layer: usize,
        unit: usize,
        reason: String,
        reply: RpcReplyPort<Result<(), ConductorError>>,
    },
    /// Internal: a background lead started by `Submit` returned
    LeadReturned {
        query_id: QueryId,
        outcome: Result<LeadOutcome, ConductorError>,
    },
}

/// Errors that can occur while driving a query
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConductorError {
    /// Query, task or subscriber record missing
    #[error("not found: {0}")]
    NotFound(String),
    /// More than one record matched where exactly one is required
    #[error("ambiguous: {0}")]
    Ambiguous(String),
    /// Bad input: not enough data, unknown function, malformed payload
    #[error("validation failed: {0}")]
    Validation(String),
    /// Stale revision or a conflict reported by a remote actor
    #[error("conflict: {0}")]
    Conflict(String),
    /// A collaborator failed or was unreachable
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// The document store failed
    #[error("store error: {0}")]
    Store(String),
}

impl ConductorError {
    pub fn code(&self) -> &'static str {
        match self {
            ConductorError::NotFound(_) => "NOT_FOUND",
            ConductorError::Ambiguous(_) => "AMBIGUOUS",
            ConductorError::Validation(_) => "VALIDATION_FAILED",
            ConductorError::Conflict(_) => "CONFLICT",
            ConductorError::Upstream(_) => "UPSTREAM_FAILED",
            ConductorError::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<StoreError> for ConductorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ConductorError::NotFound(id),
            StoreError::Conflict(id) => ConductorError::Conflict(id),
            StoreError::AlreadyExists(id) => ConductorError::Conflict(format!("{id} already exists")),
            other => ConductorError::Store(other.to_string()),
        }
    }
}

impl From<RemoteError> for ConductorError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Conflict(body) => ConductorError::Conflict(body),
            other => ConductorError::Upstream(other.to_string()),
        }
    }
}

impl From<ProfileError> for ConductorError {
    fn from(e: ProfileError) -> Self {
        match e {
            ProfileError::UnknownList(name) => {
                ConductorError::NotFound(format!("address list {name}"))
            }
            ProfileError::Malformed(reason) => ConductorError::Validation(reason),
        }
    }
}

impl From<AggregationError> for ConductorError {
    fn from(e: AggregationError) -> Self {
        ConductorError::Validation(e.to_string())
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(e: serde_json::Error) -> Self {
        ConductorError::Validation(format!("malformed payload: {e}"))
    }
}

/// What a `lead` call left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadOutcome {
    /// The data-retrieval service was asked to run the local query; the
    /// pipeline resumes when its results arrive.
    AwaitingLocalQuery,
    /// Layer `n` was sharded and dispatched (or another caller owns it).
    LayerDispatched(usize),
    /// A layer is still running; nothing new to dispatch.
    AwaitingLayer,
    /// The final result is stored.
    Finished,
}

/// Result of the stage-4 completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalResultsOutcome {
    Accepted { rows: usize, lead: LeadOutcome },
    AlreadyCompleted,
}
