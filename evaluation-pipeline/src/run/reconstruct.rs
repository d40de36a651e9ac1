use common::{error::AppError, storage::types::evaluation_run::EvaluationRun};
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{
    document::{run_metrics, score_document, ScoringPlan},
    store::RunStore,
};
use crate::scoring::ArrayKeys;

/// Overrides applied when rescoring a stored run. `None` keeps the run's own setting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recalculation {
    pub ground_truth_prefix: Option<String>,
    pub extraction_types: Option<Vec<String>>,
    pub excluded_fields: Option<Vec<String>>,
}

impl Recalculation {
    pub fn is_empty(&self) -> bool {
        self.ground_truth_prefix.is_none()
            && self.extraction_types.is_none()
            && self.excluded_fields.is_none()
    }
}

/// Rebuild a run from its stored metadata, responses and summary, rescoring every
/// document against the ground truth currently in storage.
#[instrument(skip_all, fields(run_id = %run_id, overridden = !overrides.is_empty()))]
pub async fn reconstruct_run(
    store: &RunStore,
    array_keys: &ArrayKeys,
    run_id: &str,
    overrides: &Recalculation,
) -> Result<EvaluationRun, AppError> {
    let metadata = store.read_metadata(run_id).await?;
    let summary = store.read_summary(run_id).await?;

    let mut config = metadata.config;
    if let Some(prefix) = &overrides.ground_truth_prefix {
        config.ground_truth_prefix.clone_from(prefix);
    }
    if let Some(types) = &overrides.extraction_types {
        config.extraction_types.clone_from(types);
    }
    if let Some(fields) = &overrides.excluded_fields {
        config.excluded_fields.clone_from(fields);
    }

    let plan = ScoringPlan {
        extraction_types: &config.extraction_types,
        excluded_fields: &config.excluded_fields,
        array_keys,
    };

    let mut documents = Vec::new();
    for stored in store.list_responses(run_id).await? {
        let mut responses = Vec::with_capacity(stored.iterations.len());
        for (iteration, key) in &stored.iterations {
            match store.read_json(key).await {
                Ok(response) => responses.push(response),
                Err(err) => warn!(
                    file_hash = %stored.file_hash,
                    iteration,
                    error = %err,
                    "skipping unreadable response"
                ),
            }
        }
        if responses.is_empty() {
            continue;
        }

        let ground_truth = match store
            .fetch_ground_truth(&config.ground_truth_prefix, &stored.file_hash)
            .await
        {
            Ok(ground_truth) => ground_truth,
            Err(err) => {
                warn!(file_hash = %stored.file_hash, error = %err, "ground truth unreadable");
                None
            }
        };

        let filename = responses
            .first()
            .and_then(|response| response.get("filename"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map_or_else(
                || format!("{}.{}", stored.file_hash, store.source_extension()),
                ToString::to_string,
            );

        documents.push(score_document(
            &plan,
            filename,
            stored.file_hash,
            ground_truth.as_ref(),
            responses,
        ));
    }

    let (metrics, _) = run_metrics(&documents);
    let document_count = documents.len();
    let iteration_count = documents
        .iter()
        .map(|document| document.api_responses.len())
        .sum();

    let (status, errors, completed_at) = match summary {
        Some(summary) => (summary.status, summary.errors, summary.completed_at),
        None => (metadata.status, Vec::new(), None),
    };

    info!(
        documents = document_count,
        iterations = iteration_count,
        f1 = metrics.f1_score,
        "evaluation run reconstructed"
    );

    Ok(EvaluationRun {
        run_id: metadata.run_id,
        status,
        created_at: metadata.created_at,
        completed_at,
        config,
        documents,
        metrics,
        total_files: document_count,
        completed_files: document_count,
        total_iterations: iteration_count,
        completed_iterations: iteration_count,
        errors,
    })
}
