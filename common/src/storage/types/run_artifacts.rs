use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    evaluation_metrics::{EvaluationMetrics, FieldMetrics},
    evaluation_run::{EvaluationRun, RunConfig, RunStatus},
};

/// `<prefix>/<run_id>/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub config: RunConfig,
    pub status: RunStatus,
}

impl RunMetadata {
    pub fn from_run(run: &EvaluationRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            created_at: run.created_at,
            config: run.config.clone(),
            status: run.status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounts {
    pub total_files: usize,
    pub completed_files: usize,
    pub total_iterations: usize,
    pub completed_iterations: usize,
    pub scored_documents: usize,
}

/// `<prefix>/<run_id>/results/summary.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub metrics: EvaluationMetrics,
    #[serde(default)]
    pub field_metrics: FieldMetrics,
    #[serde(default)]
    pub counts: RunCounts,
    #[serde(default)]
    pub errors: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
}

impl RunSummary {
    pub fn from_run(run: &EvaluationRun, field_metrics: FieldMetrics) -> Self {
        let scored_documents = run
            .documents
            .iter()
            .filter(|doc| doc.ground_truth.is_some())
            .count();
        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            metrics: run.metrics,
            field_metrics,
            counts: RunCounts {
                total_files: run.total_files,
                completed_files: run.completed_files,
                total_iterations: run.total_iterations,
                completed_iterations: run.completed_iterations,
                scored_documents,
            },
            errors: run.errors.clone(),
            completed_at: run.completed_at,
            config: run.config.clone(),
        }
    }
}
