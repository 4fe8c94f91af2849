//! Categorical preprocessing: text label + amount → bag-of-words sample.
//!
//! Each row contributes one `{features, truth}` sample to the output list.
//! The feature space is the configured vocabulary followed by the sign tags
//! (`pos`, `neg`) and the amount bucket tags (`amount_bucket_0..=7`).

use shared_types::{Row, Value};

use super::{coerce, field, numeric_field, opt_str_arg, str_arg, AggregationError};

/// Upper bounds (exclusive) of the amount buckets; the last bucket is open.
pub const AMOUNT_THRESHOLDS: [f64; 7] = [-550.0, -100.0, -20.0, 0.0, 50.0, 200.0, 1200.0];

pub fn sign_tag(amount: f64) -> &'static str {
    if amount < 0.0 {
        "neg"
    } else {
        "pos"
    }
}

pub fn amount_bucket(amount: f64) -> usize {
    AMOUNT_THRESHOLDS
        .iter()
        .position(|threshold| amount < *threshold)
        .unwrap_or(AMOUNT_THRESHOLDS.len())
}

/// Vocabulary extended with the derived tags, in feature order.
pub fn feature_names(vocabulary: &[String]) -> Vec<String> {
    let mut names = vocabulary.to_vec();
    names.push("pos".to_string());
    names.push("neg".to_string());
    names.extend((0..=AMOUNT_THRESHOLDS.len()).map(|i| format!("amount_bucket_{i}")));
    names
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn vocabulary(args: &Row) -> Result<Vec<String>, AggregationError> {
    let invalid = |reason: String| AggregationError::InvalidArgument {
        function: "preprocess",
        argument: "vocabulary",
        reason,
    };
    match args.get("vocabulary") {
        Some(Value::List(words)) => words
            .iter()
            .map(|word| match word {
                Value::Text(w) => Ok(w.to_lowercase()),
                other => Err(invalid(format!("expected text, found {}", other.kind()))),
            })
            .collect(),
        Some(other) => Err(invalid(format!("expected a list, found {}", other.kind()))),
        None => Err(AggregationError::MissingArgument {
            function: "preprocess",
            argument: "vocabulary",
        }),
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

pub fn preprocess(row: &Row, args: &Row, result: &mut Row) -> Result<(), AggregationError> {
    let label_key = opt_str_arg("preprocess", args, "label")?.unwrap_or("label");
    let amount_key = opt_str_arg("preprocess", args, "amount")?.unwrap_or("amount");
    let target_key = str_arg("preprocess", args, "target")?;
    let target_value = args
        .get("target_value")
        .ok_or(AggregationError::MissingArgument {
            function: "preprocess",
            argument: "target_value",
        })?;
    let output = opt_str_arg("preprocess", args, "output")?
        .unwrap_or("samples")
        .to_string();

    let label = match field(row, label_key)? {
        Value::Text(text) => text.as_str(),
        other => {
            return Err(AggregationError::TypeMismatch {
                field: label_key.to_string(),
                source: shared_types::ValueError::Unsupported(other.kind()),
            })
        }
    };
    let amount = numeric_field(row, amount_key)?;

    let mut tokens = tokenize(label);
    tokens.push(sign_tag(amount).to_string());
    tokens.push(format!("amount_bucket_{}", amount_bucket(amount)));

    let names = feature_names(&vocabulary(args)?);
    let features: Vec<f64> = names
        .iter()
        .map(|name| tokens.iter().filter(|t| *t == name).count() as f64)
        .collect();
    let truth = same_value(field(row, target_key)?, target_value);

    let mut sample = Row::new();
    sample.insert("features".to_string(), Value::from_f64_slice(&features));
    sample.insert("truth".to_string(), Value::Bool(truth));

    let samples = result
        .entry(output.clone())
        .or_insert_with(|| Value::List(Vec::new()));
    match samples {
        Value::List(items) => items.push(Value::Map(sample)),
        other => {
            return coerce(
                &output,
                Err(shared_types::ValueError::NotAList(other.kind())),
            )
        }
    }
    Ok(())
}
