use clap::{Args, Parser, Subcommand};
use common::storage::types::evaluation_run::{RunConfig, DEFAULT_ITERATIONS};
use evaluation_pipeline::run::Recalculation;

#[derive(Parser, Debug)]
#[command(author, version, about = "Score a document extraction service against ground truth")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Evaluate the corpus and print the run summary
    Run(RunArgs),
    /// Rebuild a stored run, optionally rescoring it with new filters
    Show(ShowArgs),
    /// List run ids found in storage, newest first
    Runs,
    /// Report which source documents have ground truth
    Coverage(CoverageArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Base URL of the extraction service (falls back to `extraction_endpoint` in config)
    #[arg(long, env = "EXTRACTION_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Bearer token forwarded to the extraction service
    #[arg(long, env = "EXTRACTION_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Prefix holding the source documents
    #[arg(long)]
    pub source_prefix: Option<String>,

    /// Prefix holding `<file_hash>.json` ground truth objects
    #[arg(long)]
    pub ground_truth_prefix: Option<String>,

    /// Extraction types to request and score (repeatable)
    #[arg(long = "extraction-type")]
    pub extraction_types: Vec<String>,

    /// Slash-delimited field paths to leave out of scoring (repeatable)
    #[arg(long = "exclude")]
    pub excluded_fields: Vec<String>,

    /// Extraction calls per document
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    pub iterations: u32,

    /// Restrict the run to these filenames or file hashes (repeatable)
    #[arg(long = "file")]
    pub selected_files: Vec<String>,

    /// Print per-document mismatches of the last iteration
    #[arg(long)]
    pub mismatches: bool,
}

impl RunArgs {
    pub fn into_config(self, defaults: &common::utils::config::AppConfig) -> RunConfig {
        let endpoint = self
            .endpoint
            .unwrap_or_else(|| defaults.extraction_endpoint.clone());
        let mut config = RunConfig::new(
            self.source_prefix
                .unwrap_or_else(|| defaults.source_prefix.clone()),
            self.ground_truth_prefix
                .unwrap_or_else(|| defaults.ground_truth_prefix.clone()),
            endpoint,
        );
        if !self.extraction_types.is_empty() {
            config.extraction_types = self.extraction_types;
        }
        config.excluded_fields = self.excluded_fields;
        config.iterations = self.iterations;
        config.selected_files = (!self.selected_files.is_empty()).then_some(self.selected_files);
        config.auth_token = self.token.or_else(|| defaults.extraction_token.clone());
        config
    }
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Run id to rebuild
    pub run_id: String,

    /// Score against a different ground truth prefix
    #[arg(long)]
    pub ground_truth_prefix: Option<String>,

    /// Rescore only these extraction types (repeatable)
    #[arg(long = "extraction-type")]
    pub extraction_types: Vec<String>,

    /// Rescore with these exclusions instead of the run's own (repeatable)
    #[arg(long = "exclude")]
    pub excluded_fields: Vec<String>,

    /// Print per-document mismatches of the last iteration
    #[arg(long)]
    pub mismatches: bool,
}

impl ShowArgs {
    pub fn recalculation(&self) -> Recalculation {
        Recalculation {
            ground_truth_prefix: self.ground_truth_prefix.clone(),
            extraction_types: (!self.extraction_types.is_empty())
                .then(|| self.extraction_types.clone()),
            excluded_fields: (!self.excluded_fields.is_empty())
                .then(|| self.excluded_fields.clone()),
        }
    }
}

#[derive(Args, Debug)]
pub struct CoverageArgs {
    #[arg(long)]
    pub source_prefix: Option<String>,

    #[arg(long)]
    pub ground_truth_prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::AppConfig;

    #[test]
    fn run_flags_override_config_defaults() {
        let cli = Cli::try_parse_from([
            "extraction-eval",
            "run",
            "--endpoint",
            "https://extract.example.com",
            "--extraction-type",
            "medications",
            "--exclude",
            "/medications/medications/med_sig",
            "--iterations",
            "2",
            "--file",
            "abc123.pdf",
        ])
        .expect("parse");

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let defaults = AppConfig {
            extraction_token: Some("from-config".into()),
            ..Default::default()
        };
        let config = args.into_config(&defaults);

        assert_eq!(config.extraction_endpoint, "https://extract.example.com");
        assert_eq!(config.source_prefix, defaults.source_prefix);
        assert_eq!(config.extraction_types, vec!["medications"]);
        assert_eq!(config.iterations, 2);
        assert_eq!(config.selected_files, Some(vec!["abc123.pdf".to_string()]));
        assert_eq!(config.auth_token.as_deref(), Some("from-config"));
    }

    #[test]
    fn show_without_flags_keeps_the_stored_settings() {
        let cli = Cli::try_parse_from(["extraction-eval", "show", "2025-01-01T00-00-00-abcd1234"])
            .expect("parse");
        let Command::Show(args) = cli.command else {
            panic!("expected show");
        };
        assert!(args.recalculation().is_empty());
    }
}
