use common::storage::types::{
    evaluation_metrics::{EvaluationMetrics, FieldMetrics, FieldScores},
    evaluation_run::DocumentEvaluation,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::scoring::{aggregate, compare, field_metrics, remove_fields, select_extraction_types, ArrayKeys};

/// Filters and selectors applied identically to ground truth and responses.
#[derive(Debug, Clone, Copy)]
pub struct ScoringPlan<'a> {
    pub extraction_types: &'a [String],
    pub excluded_fields: &'a [String],
    pub array_keys: &'a ArrayKeys,
}

impl ScoringPlan<'_> {
    fn prepare(&self, doc: &Value) -> (Value, usize) {
        let selected = select_extraction_types(doc, self.extraction_types);
        if self.excluded_fields.is_empty() {
            (selected, 0)
        } else {
            remove_fields(&selected, self.excluded_fields)
        }
    }
}

/// Score every iteration of one document. Without ground truth the responses are
/// kept but nothing is scored; null or empty ground truth counts as absent.
pub fn score_document(
    plan: &ScoringPlan<'_>,
    filename: String,
    file_hash: String,
    ground_truth: Option<&Value>,
    api_responses: Vec<Value>,
) -> DocumentEvaluation {
    let Some(ground_truth) = ground_truth.filter(|value| !is_blank(value)) else {
        return DocumentEvaluation {
            filename,
            file_hash,
            ground_truth: None,
            api_responses,
            scores: FieldScores::new(),
            mismatches: Vec::new(),
            true_negatives: 0,
            iteration_scores: None,
            iteration_mismatches: None,
        };
    };

    let (expected, excluded) = plan.prepare(ground_truth);
    debug!(file_hash = %file_hash, excluded, "ground truth prepared");

    let mut iteration_scores = Vec::with_capacity(api_responses.len());
    let mut iteration_mismatches = Vec::with_capacity(api_responses.len());
    let mut true_negatives = 0;

    for (index, response) in api_responses.iter().enumerate() {
        let extracted = response
            .get("extracted_data")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let (filtered, _) = plan.prepare(&extracted);
        let comparison = compare(
            &expected,
            &json!({ "extracted_data": filtered }),
            plan.array_keys,
        );

        let iteration = index.saturating_add(1);
        iteration_mismatches.push(
            comparison
                .mismatches
                .into_iter()
                .map(|mismatch| format!("[{filename} | Iter {iteration}] {mismatch}"))
                .collect::<Vec<_>>(),
        );
        iteration_scores.push(comparison.scores);
        true_negatives = comparison.true_negatives;
    }

    DocumentEvaluation {
        scores: iteration_scores.last().cloned().unwrap_or_default(),
        mismatches: iteration_mismatches.last().cloned().unwrap_or_default(),
        true_negatives,
        filename,
        file_hash,
        ground_truth: Some(expected),
        api_responses,
        iteration_scores: Some(iteration_scores),
        iteration_mismatches: Some(iteration_mismatches),
    }
}

/// Every per-iteration score map across scored documents.
/// Null or empty ground truth is treated as missing.
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

pub fn iteration_score_maps(documents: &[DocumentEvaluation]) -> impl Iterator<Item = &FieldScores> {
    documents
        .iter()
        .filter_map(|document| document.iteration_scores.as_ref())
        .flatten()
}

pub fn run_metrics(documents: &[DocumentEvaluation]) -> (EvaluationMetrics, FieldMetrics) {
    (
        aggregate(iteration_score_maps(documents)),
        field_metrics(iteration_score_maps(documents)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn scores_every_iteration_and_keeps_the_last_as_canonical() {
        let keys = ArrayKeys::default();
        let types = strings(&["patient_profile"]);
        let excluded = strings(&["/patient_profile/phone"]);
        let plan = ScoringPlan {
            extraction_types: &types,
            excluded_fields: &excluded,
            array_keys: &keys,
        };
        let ground_truth = json!({
            "patient_profile": {"name": "Jane", "phone": "555"},
            "allergy": {"allergies": ["Peanuts"]}
        });
        let responses = vec![
            json!({"extracted_data": {"patient_profile": {"name": "John", "phone": "000"}}}),
            json!({"extracted_data": {"patient_profile": {"name": "Jane"}, "allergy": {"x": 1}}}),
        ];

        let document = score_document(
            &plan,
            "doc.pdf".into(),
            "abc".into(),
            Some(&ground_truth),
            responses,
        );

        assert_eq!(
            document.ground_truth,
            Some(json!({"patient_profile": {"name": "Jane"}}))
        );
        let per_iteration = document.iteration_mismatches.as_ref().expect("scored");
        assert_eq!(
            per_iteration.first().cloned().unwrap_or_default(),
            vec!["[doc.pdf | Iter 1] [FP] patient_profile.name: expected='Jane' got='John'".to_string()]
        );
        assert!(document.mismatches.is_empty());
        assert_eq!(document.scores.get("patient_profile.name"), Some(&1.0));
        assert_eq!(document.scores.len(), 1);

        let (metrics, per_field) = run_metrics(std::slice::from_ref(&document));
        assert_eq!(metrics.true_positives, 1);
        assert_eq!(metrics.false_positives, 1);
        assert_eq!(per_field.len(), 1);
    }

    #[test]
    fn documents_without_usable_ground_truth_are_not_scored() {
        let keys = ArrayKeys::default();
        let plan = ScoringPlan {
            extraction_types: &[],
            excluded_fields: &[],
            array_keys: &keys,
        };
        let blank = [json!(null), json!({}), json!([]), json!("")];
        let ground_truths = std::iter::once(None).chain(blank.iter().map(Some));

        for ground_truth in ground_truths {
            let document = score_document(
                &plan,
                "doc.pdf".into(),
                "abc".into(),
                ground_truth,
                vec![json!({"extracted_data": {"a": 1}})],
            );

            assert!(document.ground_truth.is_none());
            assert!(document.iteration_scores.is_none());
            assert!(document.scores.is_empty());
            assert_eq!(document.api_responses.len(), 1);
            assert_eq!(run_metrics(&[document]).0, EvaluationMetrics::default());
        }
    }
}
