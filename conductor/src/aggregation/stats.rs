//! Running sums, extrema and their post-processing.

use shared_types::{Row, Value};

use super::{accumulated, numeric_field, opt_str_arg, str_arg, AggregationError};

fn weighted(
    function: &'static str,
    row: &Row,
    args: &Row,
    value: f64,
) -> Result<f64, AggregationError> {
    match opt_str_arg(function, args, "weight")? {
        None => Ok(value),
        Some(weight_key) => {
            let weight = numeric_field(row, weight_key)?;
            if weight == 0.0 {
                return Err(AggregationError::DivisionByZero(weight_key.to_string()));
            }
            Ok(value / weight)
        }
    }
}

fn add_to(result: &mut Row, output: String, delta: f64) -> Result<(), AggregationError> {
    let current = accumulated(result, &output)?.unwrap_or(0.0);
    result.insert(output, Value::Float(current + delta));
    Ok(())
}

fn output_or(args: &Row, function: &'static str, default: String) -> Result<String, AggregationError> {
    Ok(opt_str_arg(function, args, "output")?
        .map(ToString::to_string)
        .unwrap_or(default))
}

/// `out += value / weight`
pub fn sum(row: &Row, args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let key = str_arg("sum", args, "key")?;
    let value = numeric_field(row, key)?;
    let delta = weighted("sum", row, args, value)?;
    let output = output_or(args, "sum", format!("sum_{key}"))?;
    add_to(result, output, delta)
}

/// `out += value² / weight`
pub fn sum_square(row: &Row, args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let key = str_arg("sum_square", args, "key")?;
    let value = numeric_field(row, key)?;
    let delta = weighted("sum_square", row, args, value * value)?;
    let output = output_or(args, "sum_square", format!("sum_square_{key}"))?;
    add_to(result, output, delta)
}

/// `out += 1 / weight`
pub fn count(row: &Row, args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let delta = weighted("count", row, args, 1.0)?;
    let output = output_or(args, "count", "count".to_string())?;
    add_to(result, output, delta)
}

fn extremum(
    function: &'static str,
    row: &Row,
    args: &Row,
    result: &mut Row,
    replaces: fn(f64, f64) -> bool,
) -> Result<(), AggregationError> {
    let key = str_arg(function, args, "key")?;
    let value = numeric_field(row, key)?;
    let output = output_or(args, function, format!("{function}_{key}"))?;
    let replace = match accumulated(result, &output)? {
        None => true,
        Some(current) => replaces(value, current),
    };
    if replace {
        result.insert(output, Value::Float(value));
    }
    Ok(())
}

pub fn min(row: &Row, args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    extremum("min", row, args, result, |value, current| value < current)
}

pub fn max(row: &Row, args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    extremum("max", row, args, result, |value, current| value > current)
}

/// `out = result[numerator] / result[denominator]`
pub fn division(args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let numerator = str_arg("division", args, "numerator")?;
    let denominator = str_arg("division", args, "denominator")?;
    let output = str_arg("division", args, "output")?.to_string();

    let a = numeric_field(result, numerator)?;
    let b = numeric_field(result, denominator)?;
    if b == 0.0 {
        return Err(AggregationError::DivisionByZero(denominator.to_string()));
    }
    result.insert(output, Value::Float(a / b));
    Ok(())
}

/// `out = sqrt(E[x²] - E[x]²)` from two already-divided means.
pub fn standard_deviation(args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let mean = str_arg("standard_deviation", args, "mean")?;
    let mean_square = str_arg("standard_deviation", args, "mean_square")?;
    let output = output_or(args, "standard_deviation", "standard_deviation".to_string())?;

    let m = numeric_field(result, mean)?;
    let m2 = numeric_field(result, mean_square)?;
    // Rounding can push a zero variance slightly negative.
    let variance = (m2 - m * m).max(0.0);
    result.insert(output, Value::Float(variance.sqrt()));
    Ok(())
}
