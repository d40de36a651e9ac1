pub mod evaluation_metrics;
pub mod evaluation_run;
pub mod run_artifacts;
