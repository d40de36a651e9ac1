mod config;
mod context;
pub mod document;
pub mod reconstruct;
mod stages;
mod state;
pub mod store;

pub use config::RunTuning;
pub use reconstruct::Recalculation;
pub use store::{GroundTruthCoverage, RunStore, SourceDocument};

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::Poll,
    time::{Duration, Instant},
};

use chrono::Utc;
use common::{
    error::AppError,
    storage::types::{
        evaluation_run::{generate_run_id, EvaluationRun, RunConfig, RunStatus, RunTransition},
        run_artifacts::RunMetadata,
    },
};
use tokio::sync::{watch, AcquireError, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use self::{
    context::RunContext,
    stages::{enumerate_documents, evaluate_documents, summarize},
    state::ready,
};
use crate::{extraction::ExtractionService, scoring::ArrayKeys};

pub type SharedRun = Arc<RwLock<EvaluationRun>>;

type PermitFuture =
    Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

/// A place in the run queue. Waiting tickets already hold their position in the
/// semaphore's FIFO wait list.
enum Ticket {
    Granted(OwnedSemaphorePermit),
    Waiting(PermitFuture),
}

impl Ticket {
    async fn take(gate: &Arc<Semaphore>) -> Self {
        let mut acquire: PermitFuture = Box::pin(Arc::clone(gate).acquire_owned());
        match futures::poll!(acquire.as_mut()) {
            Poll::Ready(Ok(permit)) => Ticket::Granted(permit),
            Poll::Ready(Err(err)) => Ticket::Waiting(Box::pin(async move { Err(err) })),
            Poll::Pending => Ticket::Waiting(acquire),
        }
    }

    fn initial_status(&self) -> RunStatus {
        match self {
            Ticket::Granted(_) => RunStatus::Running,
            Ticket::Waiting(_) => RunStatus::Queued,
        }
    }

    async fn redeem(self) -> Result<OwnedSemaphorePermit, AcquireError> {
        match self {
            Ticket::Granted(permit) => Ok(permit),
            Ticket::Waiting(acquire) => acquire.await,
        }
    }
}

struct RunHandle {
    run: SharedRun,
    status: watch::Sender<RunStatus>,
}

impl RunHandle {
    async fn publish_status(&self) {
        let status = self.run.read().await.status;
        self.status.send_replace(status);
    }
}

/// Accepts evaluation runs and executes them one at a time, in submission order.
///
/// Live runs are held in memory for progress polling; completed runs can always
/// be rebuilt from their stored artifacts with [`RunManager::reconstruct`].
pub struct RunManager {
    store: RunStore,
    services: Arc<dyn ExtractionService>,
    array_keys: ArrayKeys,
    tuning: RunTuning,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    gate: Arc<Semaphore>,
}

impl RunManager {
    pub fn new(
        store: RunStore,
        services: Arc<dyn ExtractionService>,
        array_keys: ArrayKeys,
        tuning: RunTuning,
    ) -> Self {
        Self {
            store,
            services,
            array_keys,
            tuning,
            runs: RwLock::new(HashMap::new()),
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Register a run and schedule it. Returns the new run id immediately; the run
    /// starts `running` when nothing else is executing and `queued` otherwise.
    #[tracing::instrument(skip_all, fields(iterations = config.iterations))]
    pub async fn submit(self: &Arc<Self>, config: RunConfig) -> Result<String, AppError> {
        config.validate()?;

        let run_id = generate_run_id(Utc::now());
        let ticket = Ticket::take(&self.gate).await;
        let status = ticket.initial_status();

        let run = Arc::new(RwLock::new(EvaluationRun::new(
            run_id.clone(),
            config,
            status,
        )));
        let (status_tx, _) = watch::channel(status);
        let handle = Arc::new(RunHandle {
            run,
            status: status_tx,
        });
        self.runs
            .write()
            .await
            .insert(run_id.clone(), Arc::clone(&handle));

        info!(run_id = %run_id, status = status.as_str(), "evaluation run submitted");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.execute(handle, ticket).await;
        });

        Ok(run_id)
    }

    /// Snapshot of a live run, if this process knows it.
    pub async fn get(&self, run_id: &str) -> Option<EvaluationRun> {
        let handle = self.runs.read().await.get(run_id).cloned()?;
        let snapshot = handle.run.read().await.clone();
        Some(snapshot)
    }

    /// Snapshots of every live run, newest first.
    pub async fn list(&self) -> Vec<EvaluationRun> {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            runs.push(handle.run.read().await.clone());
        }
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        runs
    }

    /// Resolve once the run reaches a terminal status.
    pub async fn wait(&self, run_id: &str) -> Result<EvaluationRun, AppError> {
        let handle = self
            .runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("evaluation run {run_id}")))?;

        let mut status = handle.status.subscribe();
        status
            .wait_for(RunStatus::is_terminal)
            .await
            .map_err(|_| AppError::InternalError(format!("run {run_id} stopped reporting")))?;

        let snapshot = handle.run.read().await.clone();
        Ok(snapshot)
    }

    /// Rebuild a run from storage, optionally rescoring it with different filters.
    pub async fn reconstruct(
        &self,
        run_id: &str,
        overrides: &Recalculation,
    ) -> Result<EvaluationRun, AppError> {
        reconstruct::reconstruct_run(&self.store, &self.array_keys, run_id, overrides).await
    }

    async fn execute(self: Arc<Self>, handle: Arc<RunHandle>, ticket: Ticket) {
        let _permit = match ticket.redeem().await {
            Ok(permit) => permit,
            Err(err) => {
                self.fail_run(&handle, AppError::InternalError(format!("run queue closed: {err}")))
                    .await;
                return;
            }
        };

        {
            let mut run = handle.run.write().await;
            if run.status == RunStatus::Queued {
                if let Err(err) = run.transition(RunTransition::Start) {
                    warn!(run_id = %run.run_id, error = %err, "could not start queued run");
                }
            }
        }
        handle.publish_status().await;

        if let Err(err) = self.drive_run(&handle.run).await {
            self.fail_run(&handle, err).await;
        }

        handle.publish_status().await;
    }

    #[tracing::instrument(skip_all)]
    async fn drive_run(&self, run: &SharedRun) -> Result<(), AppError> {
        let (run_id, config, metadata) = {
            let snapshot = run.read().await;
            (
                snapshot.run_id.clone(),
                snapshot.config.clone(),
                RunMetadata::from_run(&snapshot),
            )
        };

        let mut ctx = RunContext::new(
            run_id,
            run,
            config,
            &self.store,
            self.services.as_ref(),
            &self.array_keys,
            &self.tuning,
        );

        if let Err(err) = self.store.write_metadata(&metadata).await {
            ctx.record_error(format!("Failed to save run metadata: {err}"))
                .await;
        }

        let machine = ready();
        let run_started = Instant::now();

        let stage_start = Instant::now();
        let machine = enumerate_documents(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let enumerate_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let machine = evaluate_documents(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let evaluate_duration = stage_start.elapsed();

        let stage_start = Instant::now();
        let _machine = summarize(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let summarize_duration = stage_start.elapsed();

        info!(
            run_id = %ctx.run_id,
            total_ms = Self::duration_millis(run_started.elapsed()),
            enumerate_ms = Self::duration_millis(enumerate_duration),
            evaluate_ms = Self::duration_millis(evaluate_duration),
            summarize_ms = Self::duration_millis(summarize_duration),
            "evaluation run finished"
        );

        Ok(())
    }

    /// Mark the run failed and make a best-effort attempt to record that in storage.
    async fn fail_run(&self, handle: &RunHandle, err: AppError) {
        let metadata = {
            let mut run = handle.run.write().await;
            error!(run_id = %run.run_id, error = %err, "evaluation run failed");
            if let Err(transition_err) = run.transition(RunTransition::Fail) {
                debug!(run_id = %run.run_id, error = %transition_err, "run already terminal");
            }
            run.errors.push(format!("Evaluation failed: {err}"));
            RunMetadata::from_run(&run)
        };

        if let Err(write_err) = self.store.write_metadata(&metadata).await {
            warn!(
                run_id = %metadata.run_id,
                error = %write_err,
                "could not persist failed run metadata"
            );
        }
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}
