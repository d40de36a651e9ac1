use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        store::{join_key, StorageManager},
        types::run_artifacts::{RunMetadata, RunSummary},
    },
    utils::config::AppConfig,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

const METADATA_FILE: &str = "metadata.json";
const RESPONSES_DIR: &str = "responses";
const SUMMARY_KEY: &str = "results/summary.json";

/// A source document found under the source prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDocument {
    pub key: String,
    pub filename: String,
    pub file_hash: String,
}

impl SourceDocument {
    pub fn from_key(key: &str) -> Self {
        let filename = key.rsplit('/').next().unwrap_or(key).to_string();
        Self {
            key: key.to_string(),
            file_hash: file_hash_from_key(key),
            filename,
        }
    }
}

/// Which source documents have ground truth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroundTruthCoverage {
    pub covered: Vec<SourceDocument>,
    pub missing: Vec<SourceDocument>,
}

/// Persisted iteration responses of one document, ordered by iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponses {
    pub file_hash: String,
    pub iterations: Vec<(u32, String)>,
}

/// Basename of `key` up to its first `.`.
pub fn file_hash_from_key(key: &str) -> String {
    let basename = key.rsplit('/').next().unwrap_or(key);
    basename.split('.').next().unwrap_or(basename).to_string()
}

/// Durable layout of evaluation runs plus access to the labeled corpus.
///
/// ```text
/// <prefix>/<run_id>/metadata.json
/// <prefix>/<run_id>/responses/<file_hash>/<iteration>.json
/// <prefix>/<run_id>/results/summary.json
/// ```
#[derive(Clone)]
pub struct RunStore {
    storage: StorageManager,
    responses_prefix: String,
    source_extension: String,
}

impl RunStore {
    pub fn new(
        storage: StorageManager,
        responses_prefix: impl Into<String>,
        source_extension: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            responses_prefix: responses_prefix.into(),
            source_extension: source_extension.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn from_config(storage: StorageManager, config: &AppConfig) -> Self {
        Self::new(
            storage,
            config.responses_prefix.clone(),
            config.source_extension.clone(),
        )
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn source_extension(&self) -> &str {
        &self.source_extension
    }

    pub fn run_dir(&self, run_id: &str) -> String {
        join_key(&[&self.responses_prefix, run_id])
    }

    pub fn metadata_key(&self, run_id: &str) -> String {
        join_key(&[&self.run_dir(run_id), METADATA_FILE])
    }

    pub fn summary_key(&self, run_id: &str) -> String {
        join_key(&[&self.run_dir(run_id), SUMMARY_KEY])
    }

    pub fn responses_dir(&self, run_id: &str) -> String {
        join_key(&[&self.run_dir(run_id), RESPONSES_DIR])
    }

    pub fn response_key(&self, run_id: &str, file_hash: &str, iteration: u32) -> String {
        join_key(&[
            &self.responses_dir(run_id),
            file_hash,
            &format!("{iteration}.json"),
        ])
    }

    pub async fn write_metadata(&self, metadata: &RunMetadata) -> Result<(), AppError> {
        self.storage
            .put_json(&self.metadata_key(&metadata.run_id), metadata)
            .await
    }

    pub async fn read_metadata(&self, run_id: &str) -> Result<RunMetadata, AppError> {
        self.storage
            .get_json_opt(&self.metadata_key(run_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("evaluation run {run_id}")))
    }

    pub async fn write_response(
        &self,
        run_id: &str,
        file_hash: &str,
        iteration: u32,
        response: &Value,
    ) -> Result<(), AppError> {
        self.storage
            .put_json(&self.response_key(run_id, file_hash, iteration), response)
            .await
    }

    pub async fn write_summary(&self, summary: &RunSummary) -> Result<(), AppError> {
        self.storage
            .put_json(&self.summary_key(&summary.run_id), summary)
            .await
    }

    pub async fn read_summary(&self, run_id: &str) -> Result<Option<RunSummary>, AppError> {
        self.storage.get_json_opt(&self.summary_key(run_id)).await
    }

    pub async fn read_json(&self, key: &str) -> Result<Value, AppError> {
        self.storage.get_json(key).await
    }

    /// Response objects of a run grouped by document, iterations in numeric order.
    pub async fn list_responses(&self, run_id: &str) -> Result<Vec<StoredResponses>, AppError> {
        let dir = self.responses_dir(run_id);
        let mut grouped: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();

        for object in self.storage.list(Some(&dir)).await? {
            let key = object.location.to_string();
            let Some(relative) = key.strip_prefix(&dir).map(|rest| rest.trim_start_matches('/'))
            else {
                continue;
            };
            let mut parts = relative.split('/');
            let (Some(file_hash), Some(file), None) = (parts.next(), parts.next(), parts.next())
            else {
                debug!(key = %key, "ignoring unexpected object under responses");
                continue;
            };
            let Some(iteration) = file
                .strip_suffix(".json")
                .and_then(|stem| stem.parse::<u32>().ok())
            else {
                debug!(key = %key, "ignoring response with non-numeric iteration");
                continue;
            };
            grouped
                .entry(file_hash.to_string())
                .or_default()
                .push((iteration, key.clone()));
        }

        Ok(grouped
            .into_iter()
            .map(|(file_hash, mut iterations)| {
                iterations.sort_by_key(|(iteration, _)| *iteration);
                StoredResponses {
                    file_hash,
                    iterations,
                }
            })
            .collect())
    }

    /// Run ids that have metadata under the responses prefix, newest first.
    pub async fn list_run_ids(&self) -> Result<Vec<String>, AppError> {
        let prefix = (!self.responses_prefix.is_empty()).then_some(self.responses_prefix.as_str());
        let mut run_ids = BTreeSet::new();

        for object in self.storage.list(prefix).await? {
            let key = object.location.to_string();
            let relative = match prefix {
                Some(prefix) => key
                    .strip_prefix(prefix)
                    .map(|rest| rest.trim_start_matches('/'))
                    .unwrap_or_default(),
                None => key.as_str(),
            };
            if let Some((run_id, METADATA_FILE)) = relative.split_once('/') {
                run_ids.insert(run_id.to_string());
            }
        }

        Ok(run_ids.into_iter().rev().collect())
    }

    /// Documents under `source_prefix` with the configured extension, ordered by key.
    pub async fn list_source_documents(
        &self,
        source_prefix: &str,
    ) -> Result<Vec<SourceDocument>, AppError> {
        let suffix = format!(".{}", self.source_extension.to_lowercase());
        let prefix = (!source_prefix.is_empty()).then_some(source_prefix);

        let mut documents: Vec<SourceDocument> = self
            .storage
            .list(prefix)
            .await?
            .into_iter()
            .map(|object| object.location.to_string())
            .filter(|key| key.to_lowercase().ends_with(&suffix))
            .map(|key| SourceDocument::from_key(&key))
            .collect();
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(documents)
    }

    pub async fn fetch_document(&self, key: &str) -> Result<Bytes, AppError> {
        Ok(self.storage.get(key).await?)
    }

    /// Ground truth for one document: its `extracted_data` field when present,
    /// otherwise the whole object. A missing object is not an error.
    pub async fn fetch_ground_truth(
        &self,
        ground_truth_prefix: &str,
        file_hash: &str,
    ) -> Result<Option<Value>, AppError> {
        let key = join_key(&[ground_truth_prefix, &format!("{file_hash}.json")]);
        let stored: Option<Value> = self.storage.get_json_opt(&key).await?;
        Ok(stored.map(|mut value| {
            let wrapped = value
                .as_object_mut()
                .and_then(|object| object.remove("extracted_data"));
            wrapped.unwrap_or(value)
        }))
    }

    pub async fn check_ground_truth_coverage(
        &self,
        source_prefix: &str,
        ground_truth_prefix: &str,
    ) -> Result<GroundTruthCoverage, AppError> {
        let prefix = (!ground_truth_prefix.is_empty()).then_some(ground_truth_prefix);
        let known: BTreeSet<String> = self
            .storage
            .list(prefix)
            .await?
            .into_iter()
            .map(|object| object.location.to_string())
            .filter(|key| key.ends_with(".json"))
            .map(|key| file_hash_from_key(&key))
            .collect();

        let mut coverage = GroundTruthCoverage::default();
        for document in self.list_source_documents(source_prefix).await? {
            if known.contains(&document.file_hash) {
                coverage.covered.push(document);
            } else {
                coverage.missing.push(document);
            }
        }
        Ok(coverage)
    }
}

#[cfg(test)]
mod tests {
    use common::storage::types::evaluation_run::{EvaluationRun, RunConfig, RunStatus};
    use serde_json::json;

    use super::*;

    fn store() -> RunStore {
        RunStore::new(StorageManager::memory(), "evaluation_runs", "pdf")
    }

    #[test]
    fn keys_follow_the_run_layout() {
        let store = store();
        assert_eq!(store.metadata_key("r1"), "evaluation_runs/r1/metadata.json");
        assert_eq!(
            store.response_key("r1", "abc", 2),
            "evaluation_runs/r1/responses/abc/2.json"
        );
        assert_eq!(store.summary_key("r1"), "evaluation_runs/r1/results/summary.json");
        assert_eq!(file_hash_from_key("source/abc123.v2.pdf"), "abc123");
    }

    #[tokio::test]
    async fn responses_group_by_document_in_numeric_order() {
        let store = store();
        for iteration in [10, 2, 1] {
            store
                .write_response("r1", "abc", iteration, &json!({"i": iteration}))
                .await
                .expect("write");
        }
        store
            .write_response("r1", "def", 1, &json!({}))
            .await
            .expect("write");

        let grouped = store.list_responses("r1").await.expect("list");
        assert_eq!(grouped.len(), 2);
        let abc = grouped.first().expect("abc");
        assert_eq!(abc.file_hash, "abc");
        let order: Vec<u32> = abc.iterations.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![1, 2, 10]);
    }

    #[tokio::test]
    async fn run_ids_are_listed_newest_first() {
        let store = store();
        let config = RunConfig::new("source", "gt", "http://localhost");
        for run_id in ["2025-01-01T00-00-00-aaaaaaaa", "2025-03-01T00-00-00-bbbbbbbb"] {
            let run = EvaluationRun::new(run_id.into(), config.clone(), RunStatus::Running);
            store
                .write_metadata(&RunMetadata::from_run(&run))
                .await
                .expect("metadata");
        }
        store
            .write_response("2025-03-01T00-00-00-bbbbbbbb", "abc", 1, &json!({}))
            .await
            .expect("response");

        let ids = store.list_run_ids().await.expect("ids");
        assert_eq!(
            ids,
            vec![
                "2025-03-01T00-00-00-bbbbbbbb".to_string(),
                "2025-01-01T00-00-00-aaaaaaaa".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn ground_truth_unwraps_extracted_data() {
        let store = store();
        let storage = store.storage();
        storage
            .put_json("gt/wrapped.json", &json!({"extracted_data": {"a": 1}, "filename": "x"}))
            .await
            .expect("put");
        storage
            .put_json("gt/bare.json", &json!({"a": 2}))
            .await
            .expect("put");

        assert_eq!(
            store.fetch_ground_truth("gt", "wrapped").await.expect("gt"),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            store.fetch_ground_truth("gt", "bare").await.expect("gt"),
            Some(json!({"a": 2}))
        );
        assert_eq!(store.fetch_ground_truth("gt", "absent").await.expect("gt"), None);
    }

    #[tokio::test]
    async fn coverage_splits_sources_by_ground_truth() {
        let store = store();
        let storage = store.storage();
        for key in ["source/one.pdf", "source/two.PDF", "source/notes.txt"] {
            storage.put(key, Bytes::from_static(b"%PDF")).await.expect("put");
        }
        storage
            .put_json("gt/one.json", &json!({}))
            .await
            .expect("put");

        let sources = store.list_source_documents("source").await.expect("sources");
        assert_eq!(sources.len(), 2);

        let coverage = store
            .check_ground_truth_coverage("source", "gt")
            .await
            .expect("coverage");
        assert_eq!(coverage.covered.len(), 1);
        assert_eq!(coverage.covered.first().map(|d| d.file_hash.as_str()), Some("one"));
        assert_eq!(coverage.missing.first().map(|d| d.filename.as_str()), Some("two.PDF"));
    }

    #[tokio::test]
    async fn missing_metadata_is_not_found() {
        let err = store().read_metadata("nope").await.expect_err("missing");
        assert!(err.is_not_found());
    }
}
