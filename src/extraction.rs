use crate::model_service::RawOutput;
use ndarray::ArrayD;
use std::fmt;
use thiserror::Error;

/// Lower and upper bound, in cm, for reading a lone output value as a height.
pub const PLAUSIBLE_HEIGHT_CM: (f64, f64) = (100.0, 220.0);
/// Height assumed when a lone output value is read as a weight.
pub const DEFAULT_HEIGHT_CM: f64 = 170.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    Positional,
    Named,
    FlatPair,
    SingleValue,
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractionStrategy::Positional => "positional",
            ExtractionStrategy::Named => "named",
            ExtractionStrategy::FlatPair => "flat_pair",
            ExtractionStrategy::SingleValue => "single_value",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("output is not {0}")]
    WrongShape(&'static str),
    #[error("expected {expected} outputs, found {found}")]
    Arity { expected: &'static str, found: usize },
    #[error("missing output `{0}`")]
    MissingKey(&'static str),
    #[error("output `{0}` is empty")]
    EmptyTensor(String),
    #[error("output `{0}` is not a finite number")]
    NotFinite(String),
    #[error("could not recover height and weight from model output: {}", .0.join("; "))]
    Unrecoverable(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extraction {
    pub height: f64,
    pub weight: f64,
    pub strategy: ExtractionStrategy,
}

type ExtractionRule = fn(&RawOutput) -> Result<(f64, f64), ExtractionError>;

/// Extraction rules by precedence; a structural failure falls through to the next.
const EXTRACTION_RULES: [(ExtractionStrategy, ExtractionRule); 4] = [
    (ExtractionStrategy::Positional, extract_positional),
    (ExtractionStrategy::Named, extract_named),
    (ExtractionStrategy::FlatPair, extract_flat_pair),
    (ExtractionStrategy::SingleValue, extract_single_value),
];

fn finite(value: f32, label: impl Into<String>) -> Result<f64, ExtractionError> {
    if value.is_finite() {
        Ok(value as f64)
    } else {
        Err(ExtractionError::NotFinite(label.into()))
    }
}

fn first_scalar(tensor: &ArrayD<f32>, label: &str) -> Result<f64, ExtractionError> {
    let value = tensor
        .iter()
        .next()
        .copied()
        .ok_or_else(|| ExtractionError::EmptyTensor(label.to_string()))?;
    finite(value, label)
}

fn extract_positional(output: &RawOutput) -> Result<(f64, f64), ExtractionError> {
    let RawOutput::Positional(tensors) = output else {
        return Err(ExtractionError::WrongShape("positional"));
    };
    match tensors.as_slice() {
        [height, weight] => Ok((first_scalar(height, "0")?, first_scalar(weight, "1")?)),
        other => Err(ExtractionError::Arity {
            expected: "2",
            found: other.len(),
        }),
    }
}

fn extract_named(output: &RawOutput) -> Result<(f64, f64), ExtractionError> {
    let RawOutput::Named(tensors) = output else {
        return Err(ExtractionError::WrongShape("name-indexed"));
    };
    let lookup = |key: &'static str| {
        tensors
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, tensor)| tensor)
            .ok_or(ExtractionError::MissingKey(key))
    };
    Ok((
        first_scalar(lookup("height")?, "height")?,
        first_scalar(lookup("weight")?, "weight")?,
    ))
}

/// Flattened output with non-finite entries dropped.
fn numeric_values(output: &RawOutput) -> Vec<f64> {
    output
        .flatten()
        .into_iter()
        .filter(|value| value.is_finite())
        .map(f64::from)
        .collect()
}

fn extract_flat_pair(output: &RawOutput) -> Result<(f64, f64), ExtractionError> {
    match numeric_values(output).as_slice() {
        [height, weight, ..] => Ok((*height, *weight)),
        other => Err(ExtractionError::Arity {
            expected: "at least 2 numeric",
            found: other.len(),
        }),
    }
}

fn extract_single_value(output: &RawOutput) -> Result<(f64, f64), ExtractionError> {
    match numeric_values(output).as_slice() {
        [value] => Ok(classify_single_value(*value)),
        other => Err(ExtractionError::Arity {
            expected: "1 numeric",
            found: other.len(),
        }),
    }
}

/// Reads a lone value as a height when it falls in the plausible band, else as a weight.
///
/// The band and `(v - 100) * 0.9` are inherited heuristics kept for compatibility.
pub fn classify_single_value(value: f64) -> (f64, f64) {
    let (low, high) = PLAUSIBLE_HEIGHT_CM;
    if (low..=high).contains(&value) {
        (value, (value - 100.0) * 0.9)
    } else {
        (DEFAULT_HEIGHT_CM, value)
    }
}

/// Pulls `(height, weight)` out of a raw engine output.
pub fn extract(output: &RawOutput) -> Result<Extraction, ExtractionError> {
    let mut failures = Vec::new();
    for (strategy, rule) in EXTRACTION_RULES {
        match rule(output) {
            Ok((height, weight)) => {
                if !failures.is_empty() {
                    tracing::warn!(
                        strategy = %strategy,
                        skipped = ?failures,
                        "Fell back to a weaker extraction strategy"
                    );
                }
                tracing::debug!(strategy = %strategy, height, weight, "Extracted prediction");
                return Ok(Extraction {
                    height,
                    weight,
                    strategy,
                });
            }
            Err(err) => failures.push(format!("{}: {}", strategy, err)),
        }
    }

    Err(ExtractionError::Unrecoverable(failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, ArrayD, IxDyn};

    #[test]
    fn test_positional_pair() {
        let output = RawOutput::Positional(vec![
            arr2(&[[181.5f32]]).into_dyn(),
            arr2(&[[77.0f32]]).into_dyn(),
        ]);

        let extraction = extract(&output).unwrap();

        assert_eq!(extraction.strategy, ExtractionStrategy::Positional);
        assert_eq!((extraction.height, extraction.weight), (181.5, 77.0));
    }

    #[test]
    fn test_named_outputs_are_read_by_key() {
        let output = RawOutput::Named(vec![
            ("weight".to_string(), arr2(&[[64.0f32]]).into_dyn()),
            ("height".to_string(), arr2(&[[168.0f32]]).into_dyn()),
        ]);

        let extraction = extract(&output).unwrap();

        assert_eq!(extraction.strategy, ExtractionStrategy::Named);
        assert_eq!((extraction.height, extraction.weight), (168.0, 64.0));
    }

    #[test]
    fn test_named_without_keys_falls_through_to_flat_pair() {
        let output = RawOutput::Named(vec![
            ("dense_1".to_string(), arr1(&[172.0f32]).into_dyn()),
            ("dense_2".to_string(), arr1(&[70.0f32]).into_dyn()),
        ]);

        let extraction = extract(&output).unwrap();

        assert_eq!(extraction.strategy, ExtractionStrategy::FlatPair);
        assert_eq!((extraction.height, extraction.weight), (172.0, 70.0));
    }

    #[test]
    fn test_positional_with_empty_tensor_falls_through() {
        let output = RawOutput::Positional(vec![
            ArrayD::<f32>::zeros(IxDyn(&[0])),
            arr1(&[80.0f32, 176.0]).into_dyn(),
        ]);

        let extraction = extract(&output).unwrap();

        assert_eq!(extraction.strategy, ExtractionStrategy::FlatPair);
        assert_eq!((extraction.height, extraction.weight), (80.0, 176.0));
    }

    #[test]
    fn test_flat_sequence_takes_first_two_entries() {
        let extraction = extract(&RawOutput::Flat(vec![178.0, 74.5, 0.3])).unwrap();

        assert_eq!(extraction.strategy, ExtractionStrategy::FlatPair);
        assert_eq!((extraction.height, extraction.weight), (178.0, 74.5));
    }

    #[test]
    fn test_single_value_in_height_band() {
        let extraction = extract(&RawOutput::Flat(vec![165.0])).unwrap();

        assert_eq!(extraction.strategy, ExtractionStrategy::SingleValue);
        assert_eq!(extraction.height, 165.0);
        assert!((extraction.weight - 58.5).abs() < 1e-9);
    }

    #[test]
    fn test_single_value_outside_band_is_weight() {
        let extraction = extract(&RawOutput::Flat(vec![95.0])).unwrap();

        assert_eq!(extraction.height, DEFAULT_HEIGHT_CM);
        assert_eq!(extraction.weight, 95.0);
    }

    #[test]
    fn test_single_value_band_edges() {
        assert_eq!(classify_single_value(100.0), (100.0, 0.0));
        assert_eq!(classify_single_value(220.0).0, 220.0);
        assert_eq!(classify_single_value(220.5), (170.0, 220.5));
        assert_eq!(classify_single_value(99.9), (170.0, 99.9));
    }

    #[test]
    fn test_single_positional_tensor_uses_heuristic() {
        let output = RawOutput::Positional(vec![arr2(&[[190.0f32]]).into_dyn()]);

        let extraction = extract(&output).unwrap();

        assert_eq!(extraction.strategy, ExtractionStrategy::SingleValue);
        assert_eq!(extraction.height, 190.0);
        assert!((extraction.weight - 81.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_entries_are_skipped() {
        let lone_weight = extract(&RawOutput::Flat(vec![f32::NAN, 70.0])).unwrap();
        let pair = extract(&RawOutput::Flat(vec![f32::INFINITY, 181.0, 79.0])).unwrap();

        assert_eq!(lone_weight.strategy, ExtractionStrategy::SingleValue);
        assert_eq!((lone_weight.height, lone_weight.weight), (DEFAULT_HEIGHT_CM, 70.0));
        assert_eq!(pair.strategy, ExtractionStrategy::FlatPair);
        assert_eq!((pair.height, pair.weight), (181.0, 79.0));
    }

    #[test]
    fn test_unrecoverable_output() {
        let empty = extract(&RawOutput::Flat(vec![]));
        let not_a_number = extract(&RawOutput::Flat(vec![f32::NAN]));

        assert!(matches!(empty, Err(ExtractionError::Unrecoverable(ref f)) if f.len() == 4));
        assert!(matches!(not_a_number, Err(ExtractionError::Unrecoverable(_))));
    }
}
