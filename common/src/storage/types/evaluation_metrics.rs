use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Flattened field path -> score for one comparison.
///
/// 1.0 exact match, (0, 1) partial match, 0.0 true negative,
/// -1.0 false positive, -2.0 false negative.
pub type FieldScores = BTreeMap<String, f64>;

pub const SCORE_MATCH: f64 = 1.0;
pub const SCORE_TRUE_NEGATIVE: f64 = 0.0;
pub const SCORE_FALSE_POSITIVE: f64 = -1.0;
pub const SCORE_FALSE_NEGATIVE: f64 = -2.0;

/// Confusion-matrix counts plus derived ratios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub accuracy: f64,
}

/// Per field path breakdown, same counts and ratios as the run-level view.
pub type FieldMetrics = BTreeMap<String, EvaluationMetrics>;

impl EvaluationMetrics {
    /// Derive the ratios from raw counts. Any ratio whose denominator is zero is 0.0.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_counts(tp: u64, fp: u64, fn_: u64, tn: u64) -> Self {
        let ratio = |num: u64, den: u64| {
            if den == 0 {
                0.0
            } else {
                num as f64 / den as f64
            }
        };

        let precision = ratio(tp, tp.saturating_add(fp));
        let recall = ratio(tp, tp.saturating_add(fn_));
        let f1_score = if precision + recall > 0.0 {
            (2.0 * precision * recall) / (precision + recall)
        } else {
            0.0
        };
        let total = tp.saturating_add(fp).saturating_add(fn_).saturating_add(tn);
        let accuracy = ratio(tp.saturating_add(tn), total);

        Self {
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
            true_negatives: tn,
            precision,
            recall,
            f1_score,
            accuracy,
        }
    }
}
