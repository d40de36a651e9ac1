use common::{
    error::AppError,
    storage::types::evaluation_run::{EvaluationRun, RunConfig},
};
use tracing::{error, warn};

use super::{config::RunTuning, store::RunStore, store::SourceDocument, SharedRun};
use crate::{extraction::ExtractionService, scoring::ArrayKeys};

pub struct RunContext<'a> {
    pub run_id: String,
    pub run: &'a SharedRun,
    pub config: RunConfig,
    pub store: &'a RunStore,
    pub services: &'a dyn ExtractionService,
    pub array_keys: &'a ArrayKeys,
    pub tuning: &'a RunTuning,
    pub documents: Vec<SourceDocument>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        run_id: String,
        run: &'a SharedRun,
        config: RunConfig,
        store: &'a RunStore,
        services: &'a dyn ExtractionService,
        array_keys: &'a ArrayKeys,
        tuning: &'a RunTuning,
    ) -> Self {
        Self {
            run_id,
            run,
            config,
            store,
            services,
            array_keys,
            tuning,
            documents: Vec::new(),
        }
    }

    /// Mutate the shared run under its write lock.
    pub async fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut EvaluationRun),
    {
        let mut run = self.run.write().await;
        apply(&mut *run);
    }

    /// Append to the run's error log.
    pub async fn record_error(&self, message: String) {
        warn!(run_id = %self.run_id, error = %message, "evaluation error recorded");
        self.update(|run| run.errors.push(message)).await;
    }

    pub fn abort(&self, err: AppError) -> AppError {
        error!(run_id = %self.run_id, error = %err, "evaluation run aborted");
        err
    }
}
