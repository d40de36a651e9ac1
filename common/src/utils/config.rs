use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
    S3,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// Semantic key selector for one array field.
#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
pub struct ArrayKeySetting {
    pub path: String,
    pub fields: Vec<String>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default = "default_source_prefix")]
    pub source_prefix: String,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
    #[serde(default = "default_ground_truth_prefix")]
    pub ground_truth_prefix: String,
    #[serde(default = "default_responses_prefix")]
    pub responses_prefix: String,
    #[serde(default)]
    pub extraction_endpoint: String,
    #[serde(default)]
    pub extraction_token: Option<String>,
    #[serde(default = "default_api_prefix")]
    pub extraction_api_prefix: String,
    #[serde(default = "default_datacontext")]
    pub extraction_datacontext: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,
    #[serde(default)]
    pub iteration_delay_ms: u64,
    #[serde(default)]
    pub file_delay_ms: u64,
    #[serde(default)]
    pub array_keys: Vec<ArrayKeySetting>,
    #[serde(default)]
    pub schema_path: Option<String>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_source_prefix() -> String {
    "source".to_string()
}

fn default_source_extension() -> String {
    "pdf".to_string()
}

fn default_ground_truth_prefix() -> String {
    "ground_truth".to_string()
}

fn default_responses_prefix() -> String {
    "evaluation_runs".to_string()
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_datacontext() -> String {
    "eval_testing".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_extraction_timeout_secs() -> u64 {
    600
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: default_storage_kind(),
            data_dir: default_data_dir(),
            s3_bucket: None,
            source_prefix: default_source_prefix(),
            source_extension: default_source_extension(),
            ground_truth_prefix: default_ground_truth_prefix(),
            responses_prefix: default_responses_prefix(),
            extraction_endpoint: String::new(),
            extraction_token: None,
            extraction_api_prefix: default_api_prefix(),
            extraction_datacontext: default_datacontext(),
            poll_interval_ms: default_poll_interval_ms(),
            extraction_timeout_secs: default_extraction_timeout_secs(),
            iteration_delay_ms: 0,
            file_delay_ms: 0,
            array_keys: Vec::new(),
            schema_path: None,
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
