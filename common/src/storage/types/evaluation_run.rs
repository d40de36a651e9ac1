use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state_machines::state_machine;
use uuid::Uuid;

use crate::error::AppError;

use super::evaluation_metrics::{EvaluationMetrics, FieldScores};

pub const MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_ITERATIONS: u32 = 3;
pub const DEFAULT_EXTRACTION_TYPES: [&str; 4] =
    ["patient_profile", "icd10_codes", "medications", "allergy"];

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTransition {
    Start,
    Complete,
    Fail,
}

impl RunTransition {
    fn as_str(self) -> &'static str {
        match self {
            RunTransition::Start => "start",
            RunTransition::Complete => "complete",
            RunTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: RunLifecycleMachine,
        initial: Queued,
        states: [Queued, Running, Completed, Failed],
        events {
            start {
                transition: { from: Queued, to: Running }
            }
            complete {
                transition: { from: Running, to: Completed }
            }
            fail {
                transition: { from: Queued, to: Failed }
                transition: { from: Running, to: Failed }
            }
        }
    }

    pub(super) fn queued() -> RunLifecycleMachine<(), Queued> {
        RunLifecycleMachine::new(())
    }
}

fn invalid_transition(state: RunStatus, event: RunTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid run transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

/// Next status for `event`, or a validation error when the lifecycle forbids it.
/// Terminal statuses accept no events.
pub fn compute_next_status(state: RunStatus, event: RunTransition) -> Result<RunStatus, AppError> {
    use lifecycle::queued;
    match (state, event) {
        (RunStatus::Queued, RunTransition::Start) => queued()
            .start()
            .map(|_| RunStatus::Running)
            .map_err(|_| invalid_transition(state, event)),
        (RunStatus::Queued, RunTransition::Fail) => queued()
            .fail()
            .map(|_| RunStatus::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (RunStatus::Running, RunTransition::Complete) => queued()
            .start()
            .map_err(|_| invalid_transition(state, event))?
            .complete()
            .map(|_| RunStatus::Completed)
            .map_err(|_| invalid_transition(state, event)),
        (RunStatus::Running, RunTransition::Fail) => queued()
            .start()
            .map_err(|_| invalid_transition(state, event))?
            .fail()
            .map(|_| RunStatus::Failed)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

/// Parameters of one evaluation run. Persisted verbatim in `metadata.json`
/// and `summary.json`, minus the auth token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub source_prefix: String,
    pub ground_truth_prefix: String,
    pub extraction_endpoint: String,
    #[serde(default)]
    pub extraction_types: Vec<String>,
    #[serde(default)]
    pub excluded_fields: Vec<String>,
    pub iterations: u32,
    #[serde(default)]
    pub selected_files: Option<Vec<String>>,
    #[serde(skip)]
    pub auth_token: Option<String>,
}

impl RunConfig {
    pub fn new(
        source_prefix: impl Into<String>,
        ground_truth_prefix: impl Into<String>,
        extraction_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            source_prefix: source_prefix.into(),
            ground_truth_prefix: ground_truth_prefix.into(),
            extraction_endpoint: extraction_endpoint.into(),
            extraction_types: DEFAULT_EXTRACTION_TYPES
                .iter()
                .map(ToString::to_string)
                .collect(),
            excluded_fields: Vec::new(),
            iterations: DEFAULT_ITERATIONS,
            selected_files: None,
            auth_token: None,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(AppError::Validation(format!(
                "iterations must be between 1 and {MAX_ITERATIONS}, got {}",
                self.iterations
            )));
        }
        if self.extraction_endpoint.trim().is_empty() {
            return Err(AppError::Validation(
                "extraction endpoint must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scoring result for one source document across all iterations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentEvaluation {
    pub filename: String,
    pub file_hash: String,
    pub ground_truth: Option<Value>,
    pub api_responses: Vec<Value>,
    /// Last iteration's scores.
    pub scores: FieldScores,
    /// Last iteration's mismatches.
    pub mismatches: Vec<String>,
    pub true_negatives: usize,
    pub iteration_scores: Option<Vec<FieldScores>>,
    pub iteration_mismatches: Option<Vec<Vec<String>>>,
}

/// Live (or reconstructed) state of an evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationRun {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    pub documents: Vec<DocumentEvaluation>,
    pub metrics: EvaluationMetrics,
    pub total_files: usize,
    pub completed_files: usize,
    pub total_iterations: usize,
    pub completed_iterations: usize,
    pub errors: Vec<String>,
}

impl EvaluationRun {
    pub fn new(run_id: String, config: RunConfig, status: RunStatus) -> Self {
        let total_files = config.selected_files.as_ref().map_or(0, Vec::len);
        let total_iterations = total_files.saturating_mul(config.iterations as usize);
        Self {
            run_id,
            status,
            created_at: Utc::now(),
            completed_at: None,
            config,
            documents: Vec::new(),
            metrics: EvaluationMetrics::default(),
            total_files,
            completed_files: 0,
            total_iterations,
            completed_iterations: 0,
            errors: Vec::new(),
        }
    }

    /// Apply a lifecycle transition in place.
    pub fn transition(&mut self, event: RunTransition) -> Result<RunStatus, AppError> {
        let next = compute_next_status(self.status, event)?;
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(next)
    }
}

/// Sortable run id: `<UTC second timestamp>-<8 hex chars>`.
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        now.format("%Y-%m-%dT%H-%M-%S"),
        suffix.get(..8).unwrap_or(&suffix)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> RunConfig {
        RunConfig::new("source", "ground_truth", "https://extract.example.com")
    }

    #[test]
    fn lifecycle_accepts_forward_transitions() {
        assert_eq!(
            compute_next_status(RunStatus::Queued, RunTransition::Start).expect("start"),
            RunStatus::Running
        );
        assert_eq!(
            compute_next_status(RunStatus::Running, RunTransition::Complete).expect("complete"),
            RunStatus::Completed
        );
        assert_eq!(
            compute_next_status(RunStatus::Running, RunTransition::Fail).expect("fail"),
            RunStatus::Failed
        );
        assert_eq!(
            compute_next_status(RunStatus::Queued, RunTransition::Fail).expect("fail"),
            RunStatus::Failed
        );
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [RunStatus::Completed, RunStatus::Failed] {
            for event in [
                RunTransition::Start,
                RunTransition::Complete,
                RunTransition::Fail,
            ] {
                assert!(compute_next_status(terminal, event).is_err());
            }
        }
        assert!(compute_next_status(RunStatus::Queued, RunTransition::Complete).is_err());
        assert!(compute_next_status(RunStatus::Running, RunTransition::Start).is_err());
    }

    #[test]
    fn transition_stamps_completion_time() {
        let mut run = EvaluationRun::new("r1".into(), config(), RunStatus::Running);
        assert!(run.completed_at.is_none());
        run.transition(RunTransition::Complete).expect("complete");
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert!(run.transition(RunTransition::Fail).is_err());
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn selected_files_seed_progress_totals() {
        let mut cfg = config();
        cfg.iterations = 2;
        cfg.selected_files = Some(vec!["a.pdf".into(), "b.pdf".into()]);
        let run = EvaluationRun::new("r1".into(), cfg, RunStatus::Queued);
        assert_eq!(run.total_files, 2);
        assert_eq!(run.total_iterations, 4);
    }

    #[test]
    fn validation_rejects_out_of_range_iterations() {
        let mut cfg = config();
        cfg.iterations = 0;
        assert!(cfg.validate().is_err());
        cfg.iterations = MAX_ITERATIONS + 1;
        assert!(cfg.validate().is_err());
        cfg.iterations = MAX_ITERATIONS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn auth_token_is_never_serialized() {
        let mut cfg = config();
        cfg.auth_token = Some("secret-token".into());
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(!json.contains("secret-token"));
    }

    #[test]
    fn run_ids_sort_by_creation_time() {
        let earlier = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 6).unwrap();
        let first = generate_run_id(earlier);
        let second = generate_run_id(later);

        assert!(first.starts_with("2025-01-02T03-04-05-"));
        assert_eq!(first.len(), "2025-01-02T03-04-05-".len() + 8);
        assert!(first < second);
    }
}
