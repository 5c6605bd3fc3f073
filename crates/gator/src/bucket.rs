use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::record::{Payload, RecordKey};
use crate::storage::{RecordStorage, StorageError};

/// Reserved storage bucket holding bucket metadata and the latest pointer.
pub const METADATA_BUCKET: &str = "__metadata__";

const LATEST_KEY: &str = "latest";
const BUCKET_KEY_PREFIX: &str = "bucket:";

/// Identifier of a bucket. Freshly allocated ids are ULIDs, so they sort
/// by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(String);

impl BucketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn metadata_key(&self) -> RecordKey {
        RecordKey::new(format!("{BUCKET_KEY_PREFIX}{}", self.0))
    }

    fn is_reserved(&self) -> bool {
        self.0 == METADATA_BUCKET
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which bucket an operation should act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketRef {
    Latest,
    Id(BucketId),
}

impl From<Option<String>> for BucketRef {
    fn from(id: Option<String>) -> Self {
        match id {
            Some(id) => Self::Id(BucketId::new(id)),
            None => Self::Latest,
        }
    }
}

/// How pulling one repository went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RepositoryOutcome {
    Succeeded {
        records: usize,
    },
    Failed {
        error: String,
        records_written: usize,
    },
}

impl RepositoryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Records this repository left in the bucket.
    pub fn records(&self) -> usize {
        match self {
            Self::Succeeded { records } => *records,
            Self::Failed {
                records_written, ..
            } => *records_written,
        }
    }
}

/// Per-repository pull metadata stored with a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryReport {
    pub repository: String,
    pub dataset_type: String,
    pub source: String,
    #[serde(flatten)]
    pub outcome: RepositoryOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A sealed, immutable snapshot of one pull run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: BucketId,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub sealed_at: u64,
    pub record_count: usize,
    pub repositories: Vec<RepositoryReport>,
}

impl Bucket {
    pub fn failed_repositories(&self) -> impl Iterator<Item = &RepositoryReport> {
        self.repositories.iter().filter(|r| !r.outcome.is_success())
    }
}

/// What the metadata bucket stores per bucket. `sealed` is absent while the
/// pull that owns the bucket is still running.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketEntry {
    id: BucketId,
    created_at: u64,
    #[serde(default)]
    sealed: Option<Bucket>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LatestPointer {
    bucket_id: BucketId,
}

/// Errors from bucket bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    #[error("bucket not found: {0}")]
    NotFound(BucketId),

    #[error("no buckets exist")]
    NoBucketsExist,

    #[error("bucket {0} is already sealed")]
    AlreadySealed(BucketId),

    #[error("bucket id {0} is reserved")]
    Reserved(BucketId),

    #[error("record {key} not found in bucket {bucket}")]
    RecordNotFound { bucket: BucketId, key: RecordKey },

    #[error("corrupt bucket metadata: {0}")]
    Metadata(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Creates, enumerates and retrieves buckets, and owns the latest pointer.
///
/// Bucket metadata lives in the storage backend itself (under
/// [`METADATA_BUCKET`]), so every process sharing a storage root sees the
/// same buckets and the same latest pointer.
pub struct BucketManager {
    storage: Arc<dyn RecordStorage>,
    metadata_lock: Mutex<()>,
}

impl BucketManager {
    pub fn new(storage: Arc<dyn RecordStorage>) -> Self {
        Self {
            storage,
            metadata_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &dyn RecordStorage {
        self.storage.as_ref()
    }

    /// Allocate a new, unsealed bucket. It stays invisible to [`get`],
    /// [`latest`] and [`list`] until the returned handle is sealed.
    ///
    /// [`get`]: Self::get
    /// [`latest`]: Self::latest
    /// [`list`]: Self::list
    pub async fn begin(&self) -> Result<PendingBucket<'_>, BucketError> {
        let entry = BucketEntry {
            id: BucketId::generate(),
            created_at: now_millis(),
            sealed: None,
        };
        self.write_entry(&entry).await?;

        info!(bucket_id = %entry.id, backend = self.storage.backend(), "created bucket");

        Ok(PendingBucket {
            manager: self,
            id: entry.id,
            created_at: entry.created_at,
        })
    }

    /// Record a sealed bucket and make it the latest. Only reachable through
    /// [`PendingBucket::seal`], so a bucket is sealed by the pull that owns it.
    pub(crate) async fn register(&self, bucket: &Bucket) -> Result<(), BucketError> {
        if bucket.id.is_reserved() {
            return Err(BucketError::Reserved(bucket.id.clone()));
        }

        let _guard = self.metadata_lock.lock().await;

        if let Some(existing) = self.read_entry(&bucket.id).await?
            && existing.sealed.is_some()
        {
            return Err(BucketError::AlreadySealed(bucket.id.clone()));
        }

        self.write_entry(&BucketEntry {
            id: bucket.id.clone(),
            created_at: bucket.created_at,
            sealed: Some(bucket.clone()),
        })
        .await?;
        self.write_latest(&bucket.id).await?;

        info!(
            bucket_id = %bucket.id,
            records = bucket.record_count,
            "sealed bucket"
        );
        Ok(())
    }

    /// Fetch a sealed bucket.
    pub async fn get(&self, id: &BucketId) -> Result<Bucket, BucketError> {
        self.read_entry(id)
            .await?
            .and_then(|entry| entry.sealed)
            .ok_or_else(|| BucketError::NotFound(id.clone()))
    }

    /// The most recently sealed bucket.
    pub async fn latest(&self) -> Result<Bucket, BucketError> {
        let pointer = match self.metadata(&RecordKey::new(LATEST_KEY)).await? {
            Some(payload) => serde_json::from_value::<LatestPointer>(payload)
                .map_err(|e| BucketError::Metadata(e.to_string()))?,
            None => return Err(BucketError::NoBucketsExist),
        };
        self.get(&pointer.bucket_id).await
    }

    pub async fn resolve(&self, target: &BucketRef) -> Result<Bucket, BucketError> {
        match target {
            BucketRef::Latest => self.latest().await,
            BucketRef::Id(id) => self.get(id).await,
        }
    }

    /// Ids of sealed buckets, oldest first.
    pub async fn list(&self) -> Result<Vec<BucketId>, BucketError> {
        Ok(self
            .sealed_buckets()
            .await?
            .into_iter()
            .map(|bucket| bucket.id)
            .collect())
    }

    /// Sealed buckets with their metadata, oldest first.
    pub async fn sealed_buckets(&self) -> Result<Vec<Bucket>, BucketError> {
        let mut buckets: Vec<Bucket> = self
            .entries()
            .await?
            .into_iter()
            .filter_map(|entry| entry.sealed)
            .collect();
        buckets.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(buckets)
    }

    /// Keys of a sealed bucket in insertion order.
    pub async fn records(&self, id: &BucketId) -> Result<Vec<RecordKey>, BucketError> {
        self.get(id).await?;
        match self.storage.list_keys(id).await {
            Ok(keys) => Ok(keys),
            // A pull with no records never creates the physical bucket.
            Err(StorageError::BucketNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one record of a sealed bucket.
    pub async fn record(&self, id: &BucketId, key: &RecordKey) -> Result<Payload, BucketError> {
        self.get(id).await?;
        self.read_record(id, key).await
    }

    /// Read a record without re-checking that the bucket is sealed. Used by
    /// callers that already resolved the bucket.
    pub(crate) async fn read_record(
        &self,
        id: &BucketId,
        key: &RecordKey,
    ) -> Result<Payload, BucketError> {
        self.storage
            .get(id, key)
            .await
            .map_err(|e| match e {
                StorageError::NotFound { .. } | StorageError::BucketNotFound(_) => {
                    BucketError::RecordNotFound {
                        bucket: id.clone(),
                        key: key.clone(),
                    }
                }
                other => BucketError::Storage(other),
            })
    }

    /// Delete a sealed bucket. If it was the latest, the pointer falls back
    /// to the newest remaining sealed bucket.
    pub async fn delete(&self, id: &BucketId) -> Result<(), BucketError> {
        self.get(id).await?;

        let _guard = self.metadata_lock.lock().await;
        self.remove(id).await?;

        let was_latest = self
            .metadata(&RecordKey::new(LATEST_KEY))
            .await?
            .and_then(|payload| serde_json::from_value::<LatestPointer>(payload).ok())
            .is_none_or(|pointer| &pointer.bucket_id == id);

        if was_latest {
            match self.sealed_buckets().await?.pop() {
                Some(newest) => self.write_latest(&newest.id).await?,
                None => self.clear_latest().await?,
            }
        }

        info!(bucket_id = %id, "deleted bucket");
        Ok(())
    }

    /// Buckets that were never sealed, e.g. left behind by a crashed pull.
    pub async fn list_incomplete(&self) -> Result<Vec<BucketId>, BucketError> {
        let entries = self.entries().await?;
        let known: HashSet<&BucketId> = entries.iter().map(|entry| &entry.id).collect();

        let mut incomplete: Vec<BucketId> = entries
            .iter()
            .filter(|entry| entry.sealed.is_none())
            .map(|entry| entry.id.clone())
            .collect();

        // Physical buckets with no metadata at all.
        for id in self.storage.list_buckets().await? {
            if !id.is_reserved() && !known.contains(&id) {
                incomplete.push(id);
            }
        }

        incomplete.sort();
        Ok(incomplete)
    }

    /// Remove every unsealed bucket. Only safe while no pull is running
    /// against the same storage.
    pub async fn discard_incomplete(&self) -> Result<Vec<BucketId>, BucketError> {
        let incomplete = self.list_incomplete().await?;
        let _guard = self.metadata_lock.lock().await;

        for id in &incomplete {
            warn!(bucket_id = %id, "discarding unsealed bucket");
            self.remove(id).await?;
        }
        Ok(incomplete)
    }

    async fn remove(&self, id: &BucketId) -> Result<(), BucketError> {
        match self.storage.delete_bucket(id).await {
            Ok(()) | Err(StorageError::BucketNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.delete_entry(id).await
    }

    async fn entries(&self) -> Result<Vec<BucketEntry>, BucketError> {
        let metadata_bucket = BucketId::new(METADATA_BUCKET);
        let keys = match self.storage.list_keys(&metadata_bucket).await {
            Ok(keys) => keys,
            Err(StorageError::BucketNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for key in keys
            .iter()
            .filter(|key| key.as_str().starts_with(BUCKET_KEY_PREFIX))
        {
            let Some(payload) = self.metadata(key).await? else {
                continue;
            };
            entries.push(
                serde_json::from_value::<BucketEntry>(payload)
                    .map_err(|e| BucketError::Metadata(format!("{key}: {e}")))?,
            );
        }
        Ok(entries)
    }

    async fn read_entry(&self, id: &BucketId) -> Result<Option<BucketEntry>, BucketError> {
        if id.is_reserved() {
            return Ok(None);
        }
        match self.metadata(&id.metadata_key()).await? {
            Some(payload) => serde_json::from_value(payload)
                .map(Some)
                .map_err(|e| BucketError::Metadata(e.to_string())),
            None => Ok(None),
        }
    }

    async fn write_entry(&self, entry: &BucketEntry) -> Result<(), BucketError> {
        let payload =
            serde_json::to_value(entry).map_err(|e| BucketError::Metadata(e.to_string()))?;
        self.put_metadata(&entry.id.metadata_key(), &payload).await
    }

    async fn delete_entry(&self, id: &BucketId) -> Result<(), BucketError> {
        self.delete_metadata(&id.metadata_key()).await
    }

    async fn write_latest(&self, id: &BucketId) -> Result<(), BucketError> {
        let payload = serde_json::to_value(LatestPointer {
            bucket_id: id.clone(),
        })
        .map_err(|e| BucketError::Metadata(e.to_string()))?;
        self.put_metadata(&RecordKey::new(LATEST_KEY), &payload)
            .await?;
        debug!(bucket_id = %id, "moved latest pointer");
        Ok(())
    }

    async fn clear_latest(&self) -> Result<(), BucketError> {
        self.delete_metadata(&RecordKey::new(LATEST_KEY)).await
    }

    async fn metadata(&self, key: &RecordKey) -> Result<Option<Payload>, BucketError> {
        match self
            .storage
            .get(&BucketId::new(METADATA_BUCKET), key)
            .await
        {
            Ok(payload) => Ok(Some(payload)),
            Err(StorageError::NotFound { .. } | StorageError::BucketNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_metadata(&self, key: &RecordKey) -> Result<(), BucketError> {
        match self
            .storage
            .delete(&BucketId::new(METADATA_BUCKET), key)
            .await
        {
            Ok(()) | Err(StorageError::BucketNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_metadata(&self, key: &RecordKey, payload: &Payload) -> Result<(), BucketError> {
        self.storage
            .put(&BucketId::new(METADATA_BUCKET), key, payload)
            .await
            .map_err(BucketError::from)
    }
}

/// Write handle for a bucket that is still being populated.
///
/// Only the holder of this handle can write records into the bucket, and
/// sealing consumes it, so a sealed bucket can never be written again.
pub struct PendingBucket<'a> {
    manager: &'a BucketManager,
    id: BucketId,
    created_at: u64,
}

impl PendingBucket<'_> {
    pub fn id(&self) -> &BucketId {
        &self.id
    }

    /// Write one record. Repeated writes to the same key overwrite.
    pub async fn put(&self, key: &RecordKey, payload: &Payload) -> Result<(), StorageError> {
        self.manager.storage.put(&self.id, key, payload).await?;
        debug!(bucket_id = %self.id, %key, "stored record");
        Ok(())
    }

    /// Seal the bucket with its per-repository metadata and register it as
    /// the latest.
    pub async fn seal(self, repositories: Vec<RepositoryReport>) -> Result<Bucket, BucketError> {
        let record_count = match self.manager.storage.list_keys(&self.id).await {
            Ok(keys) => keys.len(),
            Err(StorageError::BucketNotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };

        let bucket = Bucket {
            id: self.id,
            created_at: self.created_at,
            sealed_at: now_millis(),
            record_count,
            repositories,
        };
        self.manager.register(&bucket).await?;
        Ok(bucket)
    }

    /// Drop everything written so far without sealing.
    pub async fn discard(self) -> Result<(), BucketError> {
        let _guard = self.manager.metadata_lock.lock().await;
        self.manager.remove(&self.id).await
    }
}

fn now_millis() -> u64 {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryStorage;

    fn manager() -> BucketManager {
        BucketManager::new(Arc::new(MemoryStorage::new()))
    }

    fn succeeded(repository: &str, records: usize) -> RepositoryReport {
        RepositoryReport {
            repository: repository.to_owned(),
            dataset_type: "timetable".to_owned(),
            source: repository.to_owned(),
            outcome: RepositoryOutcome::Succeeded { records },
            warnings: vec![],
        }
    }

    #[tokio::test]
    async fn latest_fails_when_no_buckets_exist() {
        let buckets = manager();
        assert!(matches!(
            buckets.latest().await,
            Err(BucketError::NoBucketsExist)
        ));
        assert!(buckets.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_bucket_is_invisible_until_sealed() {
        let buckets = manager();
        let pending = buckets.begin().await.unwrap();
        let id = pending.id().clone();
        pending
            .put(&RecordKey::new("a"), &json!({"n": 1}))
            .await
            .unwrap();

        assert!(matches!(
            buckets.get(&id).await,
            Err(BucketError::NotFound(_))
        ));
        assert!(matches!(
            buckets.latest().await,
            Err(BucketError::NoBucketsExist)
        ));
        assert!(buckets.list().await.unwrap().is_empty());
        assert!(matches!(
            buckets.records(&id).await,
            Err(BucketError::NotFound(_))
        ));

        let sealed = pending.seal(vec![succeeded("repo", 1)]).await.unwrap();
        assert_eq!(sealed.id, id);
        assert_eq!(sealed.record_count, 1);
        assert_eq!(buckets.get(&id).await.unwrap(), sealed);
        assert_eq!(buckets.latest().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn latest_tracks_most_recently_sealed() {
        let buckets = manager();

        let first = buckets.begin().await.unwrap();
        let second = buckets.begin().await.unwrap();
        let second_id = second.id().clone();
        let first_id = first.id().clone();

        // The bucket created later is sealed first; latest follows sealing.
        second.seal(vec![]).await.unwrap();
        assert_eq!(buckets.latest().await.unwrap().id, second_id);

        first.seal(vec![]).await.unwrap();
        assert_eq!(buckets.latest().await.unwrap().id, first_id);
    }

    #[tokio::test]
    async fn list_orders_by_creation_time() {
        let buckets = manager();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let pending = buckets.begin().await.unwrap();
            ids.push(pending.id().clone());
            pending.seal(vec![]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert_eq!(buckets.list().await.unwrap(), ids);
    }

    #[tokio::test]
    async fn register_rejects_already_sealed_bucket() {
        let buckets = manager();
        let sealed = buckets.begin().await.unwrap().seal(vec![]).await.unwrap();

        let result = buckets.register(&sealed).await;
        assert!(matches!(result, Err(BucketError::AlreadySealed(_))));
    }

    #[tokio::test]
    async fn register_rejects_reserved_id() {
        let buckets = manager();
        let bucket = Bucket {
            id: BucketId::new(METADATA_BUCKET),
            created_at: 0,
            sealed_at: 0,
            record_count: 0,
            repositories: vec![],
        };
        assert!(matches!(
            buckets.register(&bucket).await,
            Err(BucketError::Reserved(_))
        ));
    }

    #[tokio::test]
    async fn empty_sealed_bucket_has_no_records() {
        let buckets = manager();
        let sealed = buckets.begin().await.unwrap().seal(vec![]).await.unwrap();

        assert_eq!(sealed.record_count, 0);
        assert!(buckets.records(&sealed.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_lookup_reports_missing_key() {
        let buckets = manager();
        let pending = buckets.begin().await.unwrap();
        pending
            .put(&RecordKey::new("present"), &json!(1))
            .await
            .unwrap();
        let sealed = pending.seal(vec![]).await.unwrap();

        assert_eq!(
            buckets
                .record(&sealed.id, &RecordKey::new("present"))
                .await
                .unwrap(),
            json!(1)
        );
        assert!(matches!(
            buckets.record(&sealed.id, &RecordKey::new("absent")).await,
            Err(BucketError::RecordNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_moves_latest_back() {
        let buckets = manager();
        let older = buckets.begin().await.unwrap().seal(vec![]).await.unwrap();
        let newer = buckets.begin().await.unwrap().seal(vec![]).await.unwrap();

        buckets.delete(&newer.id).await.unwrap();
        assert_eq!(buckets.latest().await.unwrap().id, older.id);
        assert_eq!(buckets.list().await.unwrap(), vec![older.id.clone()]);

        buckets.delete(&older.id).await.unwrap();
        assert!(matches!(
            buckets.latest().await,
            Err(BucketError::NoBucketsExist)
        ));
    }

    #[tokio::test]
    async fn delete_of_older_bucket_keeps_latest() {
        let buckets = manager();
        let older = buckets.begin().await.unwrap().seal(vec![]).await.unwrap();
        let newer = buckets.begin().await.unwrap().seal(vec![]).await.unwrap();

        buckets.delete(&older.id).await.unwrap();
        assert_eq!(buckets.latest().await.unwrap().id, newer.id);
    }

    #[tokio::test]
    async fn discard_incomplete_removes_unsealed_buckets() {
        let buckets = manager();
        let sealed = buckets.begin().await.unwrap().seal(vec![]).await.unwrap();

        let crashed = buckets.begin().await.unwrap();
        let crashed_id = crashed.id().clone();
        crashed.put(&RecordKey::new("k"), &json!(1)).await.unwrap();
        drop(crashed);

        assert_eq!(
            buckets.list_incomplete().await.unwrap(),
            vec![crashed_id.clone()]
        );

        let discarded = buckets.discard_incomplete().await.unwrap();
        assert_eq!(discarded, vec![crashed_id.clone()]);
        assert!(buckets.list_incomplete().await.unwrap().is_empty());
        assert!(
            !buckets
                .storage()
                .contains(&crashed_id, &RecordKey::new("k"))
                .await
                .unwrap()
        );
        assert_eq!(buckets.list().await.unwrap(), vec![sealed.id]);
    }

    #[tokio::test]
    async fn deleted_buckets_leave_no_metadata_behind() {
        let buckets = manager();
        let metadata = BucketId::new(METADATA_BUCKET);

        let sealed = buckets.begin().await.unwrap().seal(vec![]).await.unwrap();
        let crashed = buckets.begin().await.unwrap();
        drop(crashed);

        buckets.discard_incomplete().await.unwrap();
        buckets.delete(&sealed.id).await.unwrap();

        assert!(
            buckets
                .storage()
                .list_keys(&metadata)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(buckets.list_incomplete().await.unwrap().is_empty());
        assert!(matches!(
            buckets.latest().await,
            Err(BucketError::NoBucketsExist)
        ));
    }

    #[tokio::test]
    async fn outcome_records_counts_partial_writes() {
        let failed = RepositoryOutcome::Failed {
            error: "boom".into(),
            records_written: 2,
        };
        assert!(!failed.is_success());
        assert_eq!(failed.records(), 2);
        assert_eq!(RepositoryOutcome::Succeeded { records: 5 }.records(), 5);
    }

    #[test]
    fn repository_report_serializes_flat_status() {
        let report = succeeded("repoA", 3);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "succeeded");
        assert_eq!(value["records"], 3);
        assert!(value.get("warnings").is_none());
    }
}
