//! Two-pass logistic regression.
//!
//! - `logistic_regression_map` (per fold): hypothesis `1/(1+e^(-θ·x))` over the
//!   preprocessed samples, accumulating the gradient `Σ(truth−pred)·x` and, in
//!   the Newton-Raphson modes, the Hessian `Σ pred·(pred−1)·xᵢxⱼ`.
//! - `logistic_regression_reduce` (per fold result): elementwise sums.
//! - `logistic_regression_update`: averages by sample count and moves θ.
//!
//! Optimizer modes:
//!
//! | mode | update |
//! |---|---|
//! | `gradient_descent` | `θ -= α·g` |
//! | `newton_raphson` | computes `H⁻¹` into `hessian_inverse`, then `θ -= α·g` |
//! | `newton_raphson_exact` | `θ -= H⁻¹·g` |

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared_types::{Row, Value};

use super::{accumulated, coerce, f64_arg_or, field, opt_str_arg, AggregationError};

pub const THETA_SEED: u64 = 42;
pub const DEFAULT_LEARNING_RATE: f64 = 0.1;

const GRADIENT: &str = "gradient";
const HESSIAN: &str = "hessian";
const HESSIAN_INVERSE: &str = "hessian_inverse";
const SAMPLE_COUNT: &str = "sample_count";
const THETA: &str = "theta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimizer {
    GradientDescent,
    NewtonRaphson,
    NewtonRaphsonExact,
}

impl Optimizer {
    fn from_args(function: &'static str, args: &Row) -> Result<Self, AggregationError> {
        match opt_str_arg(function, args, "optimizer")? {
            None | Some("gradient_descent") => Ok(Optimizer::GradientDescent),
            Some("newton_raphson") => Ok(Optimizer::NewtonRaphson),
            Some("newton_raphson_exact") => Ok(Optimizer::NewtonRaphsonExact),
            Some(other) => Err(AggregationError::InvalidArgument {
                function,
                argument: "optimizer",
                reason: format!("unknown optimizer {other:?}"),
            }),
        }
    }

    fn needs_hessian(self) -> bool {
        !matches!(self, Optimizer::GradientDescent)
    }
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Deterministic starting point for θ.
pub fn seeded_theta(dimension: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..dimension).map(|_| rng.random_range(-0.5..0.5)).collect()
}

fn check_dimension(expected: usize, found: usize) -> Result<(), AggregationError> {
    if expected != found {
        return Err(AggregationError::DimensionMismatch { expected, found });
    }
    Ok(())
}

struct Sample {
    features: Vec<f64>,
    truth: f64,
}

fn parse_samples(key: &str, value: Value) -> Result<Vec<Sample>, AggregationError> {
    let items = match value {
        Value::List(items) => items,
        other => return coerce(key, Err(shared_types::ValueError::NotAList(other.kind()))),
    };
    items
        .iter()
        .map(|item| -> Result<Sample, AggregationError> {
            match item {
                Value::Map(sample) => Ok(Sample {
                    features: coerce("features", field(sample, "features")?.as_f64_list())?,
                    truth: coerce("truth", field(sample, "truth")?.as_f64())?,
                }),
                other => coerce(
                    key,
                    Err(shared_types::ValueError::Unsupported(other.kind())),
                ),
            }
        })
        .collect()
}

fn initial_theta(args: &Row, result: &Row, dimension: Option<usize>) -> Result<Vec<f64>, AggregationError> {
    if let Some(theta) = args.get(THETA) {
        return coerce(THETA, theta.as_f64_list());
    }
    if let Some(theta) = result.get(THETA) {
        return coerce(THETA, theta.as_f64_list());
    }
    let dimension = dimension.ok_or(AggregationError::InvalidArgument {
        function: "logistic_regression_map",
        argument: THETA,
        reason: "no samples and no theta to size the model".to_string(),
    })?;
    Ok(seeded_theta(dimension, seed_arg(args)?))
}

/// `seed` must be a non-negative integer; absent means [`THETA_SEED`].
fn seed_arg(args: &Row) -> Result<u64, AggregationError> {
    let invalid = |reason: String| AggregationError::InvalidArgument {
        function: "logistic_regression_map",
        argument: "seed",
        reason,
    };
    match args.get("seed") {
        None => Ok(THETA_SEED),
        Some(Value::Int(n)) => u64::try_from(*n).map_err(|_| invalid(format!("negative seed {n}"))),
        Some(other) => Err(invalid(format!("expected integer, found {}", other.kind()))),
    }
}

/// Consumes the sample list and writes `gradient`, `sample_count`, `theta`
/// and, for the Newton-Raphson modes, `hessian`.
pub fn map(args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let optimizer = Optimizer::from_args("logistic_regression_map", args)?;
    let samples_key = opt_str_arg("logistic_regression_map", args, "samples")?
        .unwrap_or("samples")
        .to_string();
    let samples = match result.remove(&samples_key) {
        Some(value) => parse_samples(&samples_key, value)?,
        None => Vec::new(),
    };

    let theta = initial_theta(args, result, samples.first().map(|s| s.features.len()))?;
    let dimension = theta.len();

    let mut gradient = vec![0.0; dimension];
    let mut hessian = vec![vec![0.0; dimension]; dimension];
    for sample in &samples {
        check_dimension(dimension, sample.features.len())?;
        let x = &sample.features;
        let prediction = sigmoid(dot(&theta, x));
        let error = sample.truth - prediction;
        for i in 0..dimension {
            gradient[i] += error * x[i];
        }
        if optimizer.needs_hessian() {
            let weight = prediction * (prediction - 1.0);
            for i in 0..dimension {
                for j in i..dimension {
                    hessian[i][j] += weight * x[i] * x[j];
                }
            }
        }
    }

    result.insert(GRADIENT.to_string(), Value::from_f64_slice(&gradient));
    if optimizer.needs_hessian() {
        for i in 0..dimension {
            for j in 0..i {
                hessian[i][j] = hessian[j][i];
            }
        }
        result.insert(HESSIAN.to_string(), Value::from_f64_matrix(&hessian));
    }
    result.insert(SAMPLE_COUNT.to_string(), Value::Float(samples.len() as f64));
    result.insert(THETA.to_string(), Value::from_f64_slice(&theta));
    Ok(())
}

fn add_vector(into: &mut Vec<f64>, other: &[f64]) -> Result<(), AggregationError> {
    check_dimension(into.len(), other.len())?;
    for (a, b) in into.iter_mut().zip(other) {
        *a += b;
    }
    Ok(())
}

/// Folds one map-side result row into the running totals.
pub fn reduce(row: &Row, _args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let gradient = coerce(GRADIENT, field(row, GRADIENT)?.as_f64_list())?;
    let mut total = match result.get(GRADIENT) {
        Some(value) => coerce(GRADIENT, value.as_f64_list())?,
        None => vec![0.0; gradient.len()],
    };
    add_vector(&mut total, &gradient)?;
    result.insert(GRADIENT.to_string(), Value::from_f64_slice(&total));

    if let Some(hessian) = row.get(HESSIAN) {
        let hessian = coerce(HESSIAN, hessian.as_f64_matrix())?;
        let mut total = match result.get(HESSIAN) {
            Some(value) => coerce(HESSIAN, value.as_f64_matrix())?,
            None => vec![vec![0.0; hessian.len()]; hessian.len()],
        };
        check_dimension(total.len(), hessian.len())?;
        for (into, other) in total.iter_mut().zip(&hessian) {
            add_vector(into, other)?;
        }
        result.insert(HESSIAN.to_string(), Value::from_f64_matrix(&total));
    }

    let count = coerce(SAMPLE_COUNT, field(row, SAMPLE_COUNT)?.as_f64())?;
    let running = accumulated(result, SAMPLE_COUNT)?.unwrap_or(0.0);
    result.insert(SAMPLE_COUNT.to_string(), Value::Float(running + count));

    if !result.contains_key(THETA) {
        if let Some(theta) = row.get(THETA) {
            result.insert(THETA.to_string(), theta.clone());
        }
    }
    Ok(())
}

/// Averages the reduced gradient (and Hessian) and writes the new `theta`.
pub fn update(args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let optimizer = Optimizer::from_args("logistic_regression_update", args)?;
    let learning_rate = f64_arg_or(
        "logistic_regression_update",
        args,
        "learning_rate",
        DEFAULT_LEARNING_RATE,
    )?;

    let count = coerce(SAMPLE_COUNT, field(result, SAMPLE_COUNT)?.as_f64())?;
    if count == 0.0 {
        return Err(AggregationError::DivisionByZero(SAMPLE_COUNT.to_string()));
    }
    let gradient: Vec<f64> = coerce(GRADIENT, field(result, GRADIENT)?.as_f64_list())?
        .into_iter()
        .map(|g| g / count)
        .collect();
    let mut theta = coerce(THETA, field(result, THETA)?.as_f64_list())?;
    check_dimension(theta.len(), gradient.len())?;

    match optimizer {
        Optimizer::GradientDescent => {
            for (t, g) in theta.iter_mut().zip(&gradient) {
                *t -= learning_rate * g;
            }
        }
        Optimizer::NewtonRaphson | Optimizer::NewtonRaphsonExact => {
            let hessian: Vec<Vec<f64>> = coerce(HESSIAN, field(result, HESSIAN)?.as_f64_matrix())?
                .into_iter()
                .map(|row| row.into_iter().map(|h| h / count).collect())
                .collect();
            check_dimension(theta.len(), hessian.len())?;
            let inverse = invert(&hessian)?;

            if optimizer == Optimizer::NewtonRaphsonExact {
                for (i, t) in theta.iter_mut().enumerate() {
                    *t -= dot(&inverse[i], &gradient);
                }
            } else {
                for (t, g) in theta.iter_mut().zip(&gradient) {
                    *t -= learning_rate * g;
                }
            }
            result.insert(HESSIAN_INVERSE.to_string(), Value::from_f64_matrix(&inverse));
        }
    }

    result.insert(THETA.to_string(), Value::from_f64_slice(&theta));
    Ok(())
}

/// Gauss-Jordan elimination with partial pivoting.
pub fn invert(matrix: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, AggregationError> {
    let n = matrix.len();
    let mut a: Vec<Vec<f64>> = matrix.to_vec();
    let mut inverse: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    for row in &a {
        check_dimension(n, row.len())?;
    }

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(AggregationError::SingularMatrix);
        }
        a.swap(col, pivot);
        inverse.swap(col, pivot);

        let scale = a[col][col];
        for j in 0..n {
            a[col][j] /= scale;
            inverse[col][j] /= scale;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row][j] -= factor * a[col][j];
                inverse[row][j] -= factor * inverse[col][j];
            }
        }
    }
    Ok(inverse)
}
