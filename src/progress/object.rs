use std::path::Path as FsPath;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::progress::{ProgressRecord, ProgressStore};

/// Progress kept as one small JSON object per show in an [ObjectStore].
///
/// Works against a local directory, memory, or a remote bucket.
#[derive(Clone)]
pub struct ObjectStoreProgressStore {
    object_store: Arc<dyn ObjectStore>,
    prefix: Path,
}

#[derive(Debug, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Serialize, Deserialize)]
struct StoredProgress {
    #[serde(flatten)]
    record: ProgressRecord,
    updated_at: DateTime<Utc>,
}

pub fn new_s3_store(
    credentials: &S3StoreConfig,
    prefix: impl Into<Path>,
) -> Result<ObjectStoreProgressStore> {
    let mut builder = object_store::aws::AmazonS3Builder::new()
        .with_access_key_id(&credentials.access_key_id)
        .with_secret_access_key(&credentials.secret_access_key)
        .with_bucket_name(&credentials.bucket);
    if let Some(region) = &credentials.region {
        builder = builder.with_region(region);
    }

    Ok(ObjectStoreProgressStore::new(Arc::new(builder.build()?), prefix))
}

impl ObjectStoreProgressStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: impl Into<Path>) -> Self {
        Self {
            object_store,
            prefix: prefix.into(),
        }
    }

    /// Store objects as files under `directory`, creating it if needed.
    pub fn local(directory: impl AsRef<FsPath>) -> Result<Self> {
        std::fs::create_dir_all(directory.as_ref())?;
        let store = LocalFileSystem::new_with_prefix(directory.as_ref())?;

        Ok(Self::new(Arc::new(store), Path::default()))
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(InMemory::new()), Path::default())
    }

    fn location(&self, show: &str) -> Path {
        self.prefix.child(format!("{show}.json"))
    }
}

#[async_trait]
impl ProgressStore for ObjectStoreProgressStore {
    #[instrument(skip(self))]
    async fn get(&self, show: &str) -> Result<Option<ProgressRecord>> {
        let location = self.location(show);

        let bytes = match self.object_store.get(&location).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredProgress = serde_json::from_slice(&bytes)?;
        Ok(Some(stored.record))
    }

    #[instrument(skip(self, record))]
    async fn put(&self, show: &str, record: &ProgressRecord) -> Result<()> {
        let location = self.location(show);
        let body = serde_json::to_vec(&StoredProgress {
            record: *record,
            updated_at: Utc::now(),
        })?;

        self.object_store
            .put(&location, Bytes::from(body))
            .await
            .map_err(|e| Error::Persistence(format!("{location}: {e}")))?;
        debug!(%location, "stored progress");

        Ok(())
    }
}
