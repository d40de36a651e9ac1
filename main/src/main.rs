mod args;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::{
    storage::{store::StorageManager, types::evaluation_run::EvaluationRun},
    utils::config::{get_config, AppConfig},
};
use evaluation_pipeline::{
    scoring::ArrayKeys, HttpExtractionClient, RunManager, RunStore, RunTuning,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config().context("failed to load configuration")?;
    let storage = StorageManager::new(&config)
        .await
        .context("failed to initialise storage backend")?;
    let store = RunStore::from_config(storage, &config);
    info!(backend = ?store.storage().backend_kind(), "storage ready");

    match cli.command {
        Command::Run(args) => {
            let show_mismatches = args.mismatches;
            let run_config = args.into_config(&config);
            let manager = build_manager(&config, store).await?;
            let run_id = manager
                .submit(run_config)
                .await
                .context("evaluation run rejected")?;
            info!(run_id = %run_id, "waiting for evaluation run");
            let run = manager.wait(&run_id).await?;
            print_run(&run, show_mismatches)?;
        }
        Command::Show(args) => {
            let manager = build_manager(&config, store).await?;
            let run = manager
                .reconstruct(&args.run_id, &args.recalculation())
                .await
                .with_context(|| format!("failed to rebuild run {}", args.run_id))?;
            print_run(&run, args.mismatches)?;
        }
        Command::Runs => {
            for run_id in store.list_run_ids().await.context("failed to list runs")? {
                println!("{run_id}");
            }
        }
        Command::Coverage(args) => {
            let source_prefix = args.source_prefix.unwrap_or(config.source_prefix);
            let ground_truth_prefix = args
                .ground_truth_prefix
                .unwrap_or(config.ground_truth_prefix);
            let coverage = store
                .check_ground_truth_coverage(&source_prefix, &ground_truth_prefix)
                .await
                .context("failed to check ground truth coverage")?;
            println!(
                "{} of {} documents have ground truth",
                coverage.covered.len(),
                coverage.covered.len() + coverage.missing.len()
            );
            for missing in &coverage.missing {
                println!("missing: {} ({})", missing.filename, missing.key);
            }
        }
    }

    Ok(())
}

async fn build_manager(config: &AppConfig, store: RunStore) -> Result<Arc<RunManager>> {
    let client =
        HttpExtractionClient::from_config(config).context("failed to build extraction client")?;
    let array_keys = ArrayKeys::from_config(config).await;
    Ok(Arc::new(RunManager::new(
        store,
        Arc::new(client),
        array_keys,
        RunTuning::from_config(config),
    )))
}

fn print_run(run: &EvaluationRun, show_mismatches: bool) -> Result<()> {
    let metrics = &run.metrics;
    println!("run:        {}", run.run_id);
    println!("status:     {}", run.status.as_str());
    println!(
        "files:      {}/{}   iterations: {}/{}",
        run.completed_files, run.total_files, run.completed_iterations, run.total_iterations
    );
    println!(
        "counts:     tp={} fp={} fn={} tn={}",
        metrics.true_positives,
        metrics.false_positives,
        metrics.false_negatives,
        metrics.true_negatives
    );
    println!(
        "precision:  {:.4}   recall: {:.4}   f1: {:.4}   accuracy: {:.4}",
        metrics.precision, metrics.recall, metrics.f1_score, metrics.accuracy
    );

    if show_mismatches {
        for document in &run.documents {
            if document.mismatches.is_empty() {
                continue;
            }
            println!();
            println!("{} ({})", document.filename, document.file_hash);
            for mismatch in &document.mismatches {
                println!("  {mismatch}");
            }
        }
    }

    if !run.errors.is_empty() {
        println!();
        println!("errors:");
        for error in &run.errors {
            println!("  {error}");
        }
    }

    let summary = serde_json::to_string(&run.metrics).context("failed to encode metrics")?;
    info!(run_id = %run.run_id, metrics = %summary, "evaluation summary");
    Ok(())
}
