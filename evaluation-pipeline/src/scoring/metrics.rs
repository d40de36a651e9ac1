use std::collections::BTreeMap;

use common::storage::types::evaluation_metrics::{
    EvaluationMetrics, FieldMetrics, FieldScores, SCORE_FALSE_NEGATIVE, SCORE_FALSE_POSITIVE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    TruePositive,
    FalsePositive,
    FalseNegative,
    TrueNegative,
}

/// Confusion-matrix bucket for one field score. Any positive score, partial
/// matches included, is a true positive; scores outside the known classes are
/// ignored.
pub fn classify(score: f64) -> Option<Outcome> {
    if score > 0.0 {
        Some(Outcome::TruePositive)
    } else if (score - SCORE_FALSE_POSITIVE).abs() < f64::EPSILON {
        Some(Outcome::FalsePositive)
    } else if (score - SCORE_FALSE_NEGATIVE).abs() < f64::EPSILON {
        Some(Outcome::FalseNegative)
    } else if score == 0.0 {
        Some(Outcome::TrueNegative)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    tp: u64,
    fp: u64,
    fn_: u64,
    tn: u64,
}

impl Tally {
    fn add(&mut self, outcome: Outcome) {
        let slot = match outcome {
            Outcome::TruePositive => &mut self.tp,
            Outcome::FalsePositive => &mut self.fp,
            Outcome::FalseNegative => &mut self.fn_,
            Outcome::TrueNegative => &mut self.tn,
        };
        *slot = slot.saturating_add(1);
    }

    fn metrics(self) -> EvaluationMetrics {
        EvaluationMetrics::from_counts(self.tp, self.fp, self.fn_, self.tn)
    }
}

/// Run-level metrics over every per-iteration score map.
pub fn aggregate<'a, I>(score_maps: I) -> EvaluationMetrics
where
    I: IntoIterator<Item = &'a FieldScores>,
{
    let mut tally = Tally::default();
    for outcome in score_maps
        .into_iter()
        .flat_map(|scores| scores.values())
        .filter_map(|score| classify(*score))
    {
        tally.add(outcome);
    }
    tally.metrics()
}

/// Per field path breakdown over the same score maps.
pub fn field_metrics<'a, I>(score_maps: I) -> FieldMetrics
where
    I: IntoIterator<Item = &'a FieldScores>,
{
    let mut tallies: BTreeMap<&'a str, Tally> = BTreeMap::new();
    for scores in score_maps {
        for (field, score) in scores {
            if let Some(outcome) = classify(*score) {
                tallies.entry(field.as_str()).or_default().add(outcome);
            }
        }
    }

    tallies
        .into_iter()
        .map(|(field, tally)| (field.to_string(), tally.metrics()))
        .collect()
}
