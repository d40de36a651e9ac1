#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod extraction;
pub mod run;
pub mod scoring;

pub use extraction::{
    client::HttpExtractionClient, ExtractionError, ExtractionRequest, ExtractionService,
};
pub use run::{RunManager, RunStore, RunTuning};
