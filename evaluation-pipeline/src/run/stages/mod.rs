use common::{
    error::AppError,
    storage::types::{
        evaluation_run::{DocumentEvaluation, RunTransition},
        run_artifacts::{RunMetadata, RunSummary},
    },
};
use state_machines::core::GuardError;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

use super::{
    context::RunContext,
    document::{is_blank, run_metrics, score_document, ScoringPlan},
    state::{Enumerated, EvaluationMachine, Evaluated, Ready, Summarized},
    store::SourceDocument,
};
use crate::extraction::ExtractionRequest;

#[instrument(level = "trace", skip_all, fields(run_id = %ctx.run_id))]
pub async fn enumerate_documents(
    machine: EvaluationMachine<(), Ready>,
    ctx: &mut RunContext<'_>,
) -> Result<EvaluationMachine<(), Enumerated>, AppError> {
    let available = ctx
        .store
        .list_source_documents(&ctx.config.source_prefix)
        .await?;
    let available_count = available.len();

    let documents: Vec<SourceDocument> = match ctx.config.selected_files.as_deref() {
        Some(selected) if !selected.is_empty() => available
            .into_iter()
            .filter(|document| {
                selected
                    .iter()
                    .any(|name| *name == document.filename || *name == document.file_hash)
            })
            .collect(),
        _ => available,
    };

    let total_files = documents.len();
    let total_iterations = total_files.saturating_mul(ctx.config.iterations as usize);
    ctx.update(|run| {
        run.total_files = total_files;
        run.total_iterations = total_iterations;
    })
    .await;

    info!(
        run_id = %ctx.run_id,
        available = available_count,
        selected = total_files,
        total_iterations,
        "source documents enumerated"
    );

    ctx.documents = documents;

    machine
        .enumerate()
        .map_err(|(_, guard)| map_guard_error("enumerate", &guard))
}

#[instrument(level = "trace", skip_all, fields(run_id = %ctx.run_id))]
pub async fn evaluate_documents(
    machine: EvaluationMachine<(), Enumerated>,
    ctx: &mut RunContext<'_>,
) -> Result<EvaluationMachine<(), Evaluated>, AppError> {
    let documents = std::mem::take(&mut ctx.documents);
    let total = documents.len();

    for (position, document) in documents.iter().enumerate() {
        info!(
            run_id = %ctx.run_id,
            file_hash = %document.file_hash,
            filename = %document.filename,
            file = position.saturating_add(1),
            total,
            "evaluating document"
        );

        match evaluate_document(ctx, document).await {
            Ok(Some(evaluation)) => {
                ctx.update(|run| {
                    run.documents.push(evaluation);
                    run.completed_files = run.completed_files.saturating_add(1);
                })
                .await;
            }
            Ok(None) => {}
            Err(err) => {
                ctx.record_error(format!(
                    "Failed to evaluate {} ({}): {err}",
                    document.filename, document.key
                ))
                .await;
            }
        }

        if position.saturating_add(1) < total && !ctx.tuning.file_delay.is_zero() {
            sleep(ctx.tuning.file_delay).await;
        }
    }

    ctx.documents = documents;

    machine
        .evaluate()
        .map_err(|(_, guard)| map_guard_error("evaluate", &guard))
}

/// Run every iteration for one document and score them. `None` when no
/// iteration produced a response.
async fn evaluate_document(
    ctx: &RunContext<'_>,
    document: &SourceDocument,
) -> Result<Option<DocumentEvaluation>, AppError> {
    let ground_truth = ctx
        .store
        .fetch_ground_truth(&ctx.config.ground_truth_prefix, &document.file_hash)
        .await?;
    if ground_truth.as_ref().filter(|value| !is_blank(value)).is_none() {
        info!(
            run_id = %ctx.run_id,
            file_hash = %document.file_hash,
            "no ground truth; running extraction only"
        );
    }

    let content = ctx.store.fetch_document(&document.key).await?;
    let iterations = ctx.config.iterations;
    let mut responses = Vec::with_capacity(iterations as usize);

    for iteration in 1..=iterations {
        let request = ExtractionRequest {
            document: content.clone(),
            filename: document.filename.clone(),
            endpoint: ctx.config.extraction_endpoint.clone(),
            extraction_types: ctx.config.extraction_types.clone(),
            auth_token: ctx.config.auth_token.clone(),
        };

        match ctx.services.extract(request).await {
            Ok(response) => {
                let persisted = ctx
                    .store
                    .write_response(&ctx.run_id, &document.file_hash, iteration, &response)
                    .await;
                responses.push(response);
                if let Err(err) = persisted {
                    ctx.record_error(format!(
                        "Failed to save iteration {iteration} for {}: {err}",
                        document.filename
                    ))
                    .await;
                }
                ctx.update(|run| {
                    run.completed_iterations = run.completed_iterations.saturating_add(1);
                })
                .await;
                debug!(
                    run_id = %ctx.run_id,
                    file_hash = %document.file_hash,
                    iteration,
                    "iteration completed"
                );
            }
            Err(err) => {
                ctx.record_error(format!(
                    "Iteration {iteration} failed for {}: {err}",
                    document.filename
                ))
                .await;
            }
        }

        if iteration < iterations && !ctx.tuning.iteration_delay.is_zero() {
            sleep(ctx.tuning.iteration_delay).await;
        }
    }

    if responses.is_empty() {
        ctx.record_error(format!("All iterations failed for {}", document.filename))
            .await;
        return Ok(None);
    }

    let plan = ScoringPlan {
        extraction_types: &ctx.config.extraction_types,
        excluded_fields: &ctx.config.excluded_fields,
        array_keys: ctx.array_keys,
    };
    Ok(Some(score_document(
        &plan,
        document.filename.clone(),
        document.file_hash.clone(),
        ground_truth.as_ref(),
        responses,
    )))
}

#[instrument(level = "trace", skip_all, fields(run_id = %ctx.run_id))]
pub async fn summarize(
    machine: EvaluationMachine<(), Evaluated>,
    ctx: &mut RunContext<'_>,
) -> Result<EvaluationMachine<(), Summarized>, AppError> {
    let (summary, metadata) = {
        let mut run = ctx.run.write().await;
        let (metrics, per_field) = run_metrics(&run.documents);
        run.metrics = metrics;
        run.transition(RunTransition::Complete)?;
        (RunSummary::from_run(&run, per_field), RunMetadata::from_run(&run))
    };

    info!(
        run_id = %ctx.run_id,
        precision = summary.metrics.precision,
        recall = summary.metrics.recall,
        f1 = summary.metrics.f1_score,
        accuracy = summary.metrics.accuracy,
        errors = summary.errors.len(),
        "evaluation metrics computed"
    );

    if let Err(err) = ctx.store.write_summary(&summary).await {
        ctx.record_error(format!("Failed to save results summary: {err}"))
            .await;
    }
    if let Err(err) = ctx.store.write_metadata(&metadata).await {
        ctx.record_error(format!("Failed to refresh run metadata: {err}"))
            .await;
    }

    machine
        .summarize()
        .map_err(|(_, guard)| map_guard_error("summarize", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid evaluation pipeline transition during {event}: {guard:?}"
    ))
}
