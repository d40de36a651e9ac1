use std::collections::BTreeSet;

use common::storage::types::evaluation_metrics::{
    FieldScores, SCORE_FALSE_NEGATIVE, SCORE_FALSE_POSITIVE, SCORE_MATCH, SCORE_TRUE_NEGATIVE,
};
use serde_json::Value;

use super::{
    flatten::{flatten, ArrayKeys, FlatMap, EMPTY_SENTINEL},
    normalize::{display_value, normalize},
};

/// Outcome of comparing one response against its ground truth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comparison {
    pub scores: FieldScores,
    pub mismatches: Vec<String>,
    pub true_negatives: usize,
}

impl Comparison {
    fn record(&mut self, key: String, score: f64, mismatch: Option<String>) {
        if let Some(mismatch) = mismatch {
            self.mismatches.push(mismatch);
        }
        self.scores.insert(key, score);
    }

    fn true_negative(&mut self, key: String) {
        self.true_negatives = self.true_negatives.saturating_add(1);
        self.scores.insert(key, SCORE_TRUE_NEGATIVE);
    }
}

/// Field-by-field diff of `response.extracted_data` against `ground_truth`.
///
/// Wrong values count as false positives, missing expected values as false
/// negatives. Response values that normalize to an empty string are treated as
/// absent.
pub fn compare(ground_truth: &Value, response: &Value, keys: &ArrayKeys) -> Comparison {
    let empty = Value::Object(serde_json::Map::new());
    let extracted = response.get("extracted_data").unwrap_or(&empty);

    let expected = flatten(ground_truth, keys);
    let actual = drop_blank_values(flatten(extracted, keys));

    let paths: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    let mut comparison = Comparison::default();

    for path in paths {
        let exp = expected.get(path).filter(|value| !value.is_null());
        let act = actual.get(path);

        if matches!(exp, Some(Value::Array(_))) || matches!(act, Some(Value::Array(_))) {
            compare_sets(&mut comparison, path, exp, act);
            continue;
        }

        let is_sentinel = path
            .rsplit_once('.')
            .is_some_and(|(_, last)| last == EMPTY_SENTINEL);

        match (exp, act) {
            (None, None) => comparison.true_negative(path.clone()),
            (Some(Value::Bool(true)), act) if is_sentinel => match act {
                None | Some(Value::Bool(true)) => comparison.true_negative(path.clone()),
                Some(act) => comparison.record(
                    path.clone(),
                    SCORE_FALSE_POSITIVE,
                    Some(format!(
                        "[FP] {path}: unexpected='{}' (expected null)",
                        display_value(act)
                    )),
                ),
            },
            (None, Some(act)) => comparison.record(
                path.clone(),
                SCORE_FALSE_POSITIVE,
                Some(format!("[FP] {path}: unexpected='{}'", display_value(act))),
            ),
            (Some(exp), None) => comparison.record(
                path.clone(),
                SCORE_FALSE_NEGATIVE,
                Some(format!("[FN] {path}: missing (expected='{}')", display_value(exp))),
            ),
            (Some(exp), Some(act)) => {
                if normalize(exp) == normalize(act) {
                    comparison.record(path.clone(), SCORE_MATCH, None);
                } else {
                    comparison.record(
                        path.clone(),
                        SCORE_FALSE_POSITIVE,
                        Some(format!(
                            "[FP] {path}: expected='{}' got='{}'",
                            display_value(exp),
                            display_value(act)
                        )),
                    );
                }
            }
        }
    }

    comparison
}

fn is_blank(value: &Value) -> bool {
    normalize(value).is_empty()
}

fn drop_blank_values(flat: FlatMap) -> FlatMap {
    flat.into_iter()
        .filter_map(|(path, value)| match value {
            Value::Array(items) => {
                let kept: Vec<Value> = items.into_iter().filter(|item| !is_blank(item)).collect();
                (!kept.is_empty()).then_some((path, Value::Array(kept)))
            }
            other => (!is_blank(&other)).then_some((path, other)),
        })
        .collect()
}

/// Distinct values by normalized form, first occurrence wins.
fn distinct(value: Option<&Value>) -> Vec<(String, &Value)> {
    let items: Vec<&Value> = match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    };

    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_null())
        .filter_map(|item| {
            let normalized = normalize(item);
            seen.insert(normalized.clone()).then_some((normalized, item))
        })
        .collect()
}

/// Membership is decided on normalized values: items differing only in case or
/// surrounding whitespace ("HTN", "htn") score as a match, not as an FN plus an FP.
fn compare_sets(comparison: &mut Comparison, path: &str, exp: Option<&Value>, act: Option<&Value>) {
    let expected = distinct(exp);
    let actual = distinct(act);

    for (normalized, item) in &expected {
        let shown = display_value(item);
        let key = format!("{path}[{shown}]");
        if actual.iter().any(|(other, _)| other == normalized) {
            comparison.record(key, SCORE_MATCH, None);
        } else {
            let mismatch = format!("[FN] {key}: missing (expected='{shown}')");
            comparison.record(key, SCORE_FALSE_NEGATIVE, Some(mismatch));
        }
    }

    for (normalized, item) in &actual {
        if expected.iter().any(|(other, _)| other == normalized) {
            continue;
        }
        let shown = display_value(item);
        let key = format!("{path}[{shown}]");
        let mismatch = format!("[FP] {key}: unexpected='{shown}'");
        comparison.record(key, SCORE_FALSE_POSITIVE, Some(mismatch));
    }
}
