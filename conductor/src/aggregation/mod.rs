//! Numeric aggregation library executed inside each aggregation worker
//!
//! A job is `{function, args}` resolved by exact name against a closed
//! registry. Two kinds of function exist:
//!
//! - **row** functions fold one input row into the result map and run once per
//!   row, in job order
//! - **result-map** functions post-process the accumulated result map and run
//!   once, in job order, after the row pass
//!
//! Every job list is resolved before any row is touched, so an unknown name
//! aborts the batch without a partial result.

use shared_types::{AggregationJob, Row, Value, ValueError};

pub mod logistic;
pub mod preprocess;
pub mod stats;

/// Errors raised while running an aggregation batch
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum AggregationError {
    #[error("unknown aggregation function: {0}")]
    UnknownFunction(String),

    #[error("{function}: missing argument `{argument}`")]
    MissingArgument {
        function: &'static str,
        argument: &'static str,
    },

    #[error("{function}: invalid argument `{argument}`: {reason}")]
    InvalidArgument {
        function: &'static str,
        argument: &'static str,
        reason: String,
    },

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("type mismatch on `{field}`: {source}")]
    TypeMismatch { field: String, source: ValueError },

    #[error("division by zero in `{0}`")]
    DivisionByZero(String),

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("matrix is singular")]
    SingularMatrix,
}

pub type RowFn = fn(&Row, &Row, &mut Row) -> Result<(), AggregationError>;
pub type ResultMapFn = fn(&Row, &mut Row) -> Result<(), AggregationError>;

#[derive(Clone, Copy)]
pub enum Aggregation {
    /// `(row, args, result)`
    Row(RowFn),
    /// `(args, result)`
    ResultMap(ResultMapFn),
}

/// The closed function registry.
pub fn lookup(name: &str) -> Option<Aggregation> {
    let aggregation = match name {
        "sum" => Aggregation::Row(stats::sum),
        "sum_square" => Aggregation::Row(stats::sum_square),
        "count" => Aggregation::Row(stats::count),
        "min" => Aggregation::Row(stats::min),
        "max" => Aggregation::Row(stats::max),
        "preprocess" => Aggregation::Row(preprocess::preprocess),
        "logistic_regression_map" => Aggregation::ResultMap(logistic::map),
        "logistic_regression_reduce" => Aggregation::Row(logistic::reduce),
        "logistic_regression_update" => Aggregation::ResultMap(logistic::update),
        "division" => Aggregation::ResultMap(stats::division),
        "standard_deviation" => Aggregation::ResultMap(stats::standard_deviation),
        _ => return None,
    };
    Some(aggregation)
}

/// Run an ordered job list over a batch, threading one result map through.
pub fn run_jobs(rows: &[Row], jobs: &[AggregationJob]) -> Result<Row, AggregationError> {
    let resolved = jobs
        .iter()
        .map(|job| {
            lookup(&job.function)
                .map(|aggregation| (job, aggregation))
                .ok_or_else(|| AggregationError::UnknownFunction(job.function.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut result = Row::new();
    for row in rows {
        for (job, aggregation) in &resolved {
            if let Aggregation::Row(apply) = aggregation {
                apply(row, &job.args, &mut result)?;
            }
        }
    }
    for (job, aggregation) in &resolved {
        if let Aggregation::ResultMap(apply) = aggregation {
            apply(&job.args, &mut result)?;
        }
    }
    Ok(result)
}

// ============================================================================
// Argument and field helpers
// ============================================================================

pub(crate) fn str_arg<'a>(
    function: &'static str,
    args: &'a Row,
    argument: &'static str,
) -> Result<&'a str, AggregationError> {
    match args.get(argument) {
        Some(Value::Text(s)) => Ok(s),
        Some(other) => Err(AggregationError::InvalidArgument {
            function,
            argument,
            reason: format!("expected text, found {}", other.kind()),
        }),
        None => Err(AggregationError::MissingArgument { function, argument }),
    }
}

pub(crate) fn opt_str_arg<'a>(
    function: &'static str,
    args: &'a Row,
    argument: &'static str,
) -> Result<Option<&'a str>, AggregationError> {
    match args.get(argument) {
        None => Ok(None),
        Some(_) => str_arg(function, args, argument).map(Some),
    }
}

pub(crate) fn f64_arg_or(
    function: &'static str,
    args: &Row,
    argument: &'static str,
    default: f64,
) -> Result<f64, AggregationError> {
    match args.get(argument) {
        None => Ok(default),
        Some(value) => value
            .as_f64()
            .map_err(|e| AggregationError::InvalidArgument {
                function,
                argument,
                reason: e.to_string(),
            }),
    }
}

pub(crate) fn field<'a>(row: &'a Row, name: &str) -> Result<&'a Value, AggregationError> {
    row.get(name)
        .ok_or_else(|| AggregationError::MissingField(name.to_string()))
}

pub(crate) fn numeric_field(row: &Row, name: &str) -> Result<f64, AggregationError> {
    coerce(name, field(row, name)?.as_f64())
}

pub(crate) fn coerce<T>(name: &str, value: Result<T, ValueError>) -> Result<T, AggregationError> {
    value.map_err(|source| AggregationError::TypeMismatch {
        field: name.to_string(),
        source,
    })
}

/// Current numeric value of a result key, if it has been set.
pub(crate) fn accumulated(result: &Row, key: &str) -> Result<Option<f64>, AggregationError> {
    result
        .get(key)
        .map(|value| coerce(key, value.as_f64()))
        .transpose()
}
