use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::AppError;
use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Thin wrapper over the configured object store backend.
///
/// Every artifact the evaluator reads or writes (source documents, ground truth,
/// run metadata, iteration responses, summaries) goes through this type.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
}

impl StorageManager {
    /// Create a new StorageManager with the specified configuration.
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let store = create_storage_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
        })
    }

    /// Create a StorageManager with a custom storage backend.
    ///
    /// Tests use this to inject an in-memory store.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
        }
    }

    /// Fresh in-memory backend.
    pub fn memory() -> Self {
        Self::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    /// Store bytes at the specified location.
    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await.map(|_| ())
    }

    /// Retrieve bytes from the specified location.
    ///
    /// Returns the full contents buffered in memory.
    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    /// List all objects below the specified prefix.
    pub async fn list(
        &self,
        prefix: Option<&str>,
    ) -> object_store::Result<Vec<object_store::ObjectMeta>> {
        let prefix_path = prefix.map(ObjPath::from);
        self.store.list(prefix_path.as_ref()).try_collect().await
    }

    /// Check if an object exists at the specified location.
    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.store
            .head(&path)
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }

    /// Serialize `value` as pretty JSON and store it.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        location: &str,
        value: &T,
    ) -> Result<(), AppError> {
        let body = serde_json::to_vec_pretty(value)?;
        self.put(location, Bytes::from(body)).await?;
        Ok(())
    }

    /// Load and deserialize a JSON object.
    pub async fn get_json<T: DeserializeOwned>(&self, location: &str) -> Result<T, AppError> {
        let body = self.get(location).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Like [`Self::get_json`], but a missing object yields `None`.
    pub async fn get_json_opt<T: DeserializeOwned>(
        &self,
        location: &str,
    ) -> Result<Option<T>, AppError> {
        match self.get_json(location).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Join storage key segments with `/`, ignoring empty segments and stray slashes.
pub fn join_key(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Create a storage backend based on configuration.
async fn create_storage_backend(cfg: &AppConfig) -> object_store::Result<DynStore> {
    match cfg.storage {
        StorageKind::Local => {
            let base = PathBuf::from(&cfg.data_dir);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base)?;
            Ok(Arc::new(store))
        }
        StorageKind::Memory => Ok(Arc::new(InMemory::new())),
        StorageKind::S3 => {
            let bucket = cfg.s3_bucket.clone().ok_or_else(|| object_store::Error::Generic {
                store: "S3",
                source: "s3_bucket must be set when storage = \"s3\"".into(),
            })?;
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn json_round_trip_through_memory_backend() {
        let storage = StorageManager::memory();
        storage
            .put_json("runs/r1/metadata.json", &json!({"status": "running"}))
            .await
            .expect("put");

        let loaded: Value = storage.get_json("runs/r1/metadata.json").await.expect("get");
        assert_eq!(loaded["status"], "running");
        assert!(storage.exists("runs/r1/metadata.json").await.expect("head"));
    }

    #[tokio::test]
    async fn missing_objects_are_none_for_optional_reads() {
        let storage = StorageManager::memory();
        let loaded: Option<Value> = storage
            .get_json_opt("runs/missing/metadata.json")
            .await
            .expect("optional get");
        assert!(loaded.is_none());
        assert!(!storage.exists("runs/missing/metadata.json").await.expect("head"));
    }

    #[tokio::test]
    async fn list_is_scoped_to_prefix() {
        let storage = StorageManager::memory();
        storage.put("a/one.json", Bytes::from_static(b"{}")).await.expect("put");
        storage.put("a/two.json", Bytes::from_static(b"{}")).await.expect("put");
        storage.put("b/three.json", Bytes::from_static(b"{}")).await.expect("put");

        let listed = storage.list(Some("a")).await.expect("list");
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn local_backend_creates_its_base_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("nested");
        let cfg = AppConfig {
            data_dir: base.to_string_lossy().into_owned(),
            storage: StorageKind::Local,
            ..Default::default()
        };

        let storage = StorageManager::new(&cfg).await.expect("local storage");
        storage
            .put("gt/abc.json", Bytes::from_static(b"{\"extracted_data\":{}}"))
            .await
            .expect("put");
        assert!(base.join("gt").join("abc.json").exists());
    }

    #[test]
    fn join_key_skips_empty_segments() {
        assert_eq!(join_key(&["runs/", "", "r1", "/metadata.json"]), "runs/r1/metadata.json");
        assert_eq!(join_key(&["", "r1"]), "r1");
    }
}
