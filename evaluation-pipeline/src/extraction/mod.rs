//! Client side of the asynchronous extraction job API.

pub mod client;
pub mod poll;

use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("upload failed with HTTP {status}: {body}")]
    Upload { status: u16, body: String },
    #[error("upload response is missing a job id: {0}")]
    MissingJobId(String),
    #[error("transient poll failure: {0}")]
    TransientPollFailure(String),
    #[error("extraction failed for {filename}: {detail}")]
    ExtractionFailed { filename: String, detail: String },
    #[error("timed out after {timeout_secs}s waiting for extraction of {filename}; last status: {last_status}")]
    ExtractionTimeout {
        filename: String,
        timeout_secs: u64,
        last_status: String,
    },
    #[error("retrieve failed with HTTP {status}: {body}")]
    Retrieve { status: u16, body: String },
    #[error("invalid extraction endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<ExtractionError> for AppError {
    fn from(err: ExtractionError) -> Self {
        AppError::Extraction(err.to_string())
    }
}

/// One extraction call: a document plus the parameters of the run it belongs to.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub document: Bytes,
    pub filename: String,
    pub endpoint: String,
    pub extraction_types: Vec<String>,
    pub auth_token: Option<String>,
}

/// Submit, wait for, and retrieve one extraction job.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(&self, request: ExtractionRequest) -> Result<Value, ExtractionError>;
}
