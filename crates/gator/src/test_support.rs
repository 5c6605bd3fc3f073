//! In-memory fakes for exercising pulls and syncs without a network or a
//! database, plus a behavioral suite every [`RecordStorage`] backend must
//! pass.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;

use crate::canonical::{CanonicalError, CanonicalStore};
use crate::fetcher::{DatasetFetcher, FetchError};
use crate::record::{Fingerprint, Payload, Record, RecordKey};
use crate::registry::{FetcherResult, ResolveError};
use crate::repolist::RepositoryDescriptor;

/// A fetcher that returns a fixed set of records.
#[derive(Debug, Clone)]
pub struct StaticFetcher {
    label: String,
    records: Vec<Record>,
}

impl StaticFetcher {
    pub fn new(label: &str, records: Vec<Record>) -> Self {
        Self {
            label: label.to_owned(),
            records,
        }
    }
}

#[async_trait::async_trait]
impl DatasetFetcher for StaticFetcher {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        Ok(self.records.clone())
    }
}

/// A fetcher that always fails with a network error.
#[derive(Debug, Clone)]
pub struct FailingFetcher {
    label: String,
    message: String,
}

impl FailingFetcher {
    pub fn new(label: &str, message: &str) -> Self {
        Self {
            label: label.to_owned(),
            message: message.to_owned(),
        }
    }
}

#[async_trait::async_trait]
impl DatasetFetcher for FailingFetcher {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        Err(FetchError::Network(self.message.clone()))
    }
}

/// A factory serving canned records per descriptor source. Sources without
/// an entry get a [`FailingFetcher`].
pub fn static_sources(
    sources: HashMap<String, Vec<Record>>,
) -> impl Fn(&RepositoryDescriptor) -> FetcherResult + Send + Sync + 'static {
    move |descriptor: &RepositoryDescriptor| -> FetcherResult {
        match sources.get(&descriptor.source) {
            Some(records) => Ok(Box::new(StaticFetcher::new(
                &descriptor.source,
                records.clone(),
            ))),
            None => Ok(Box::new(FailingFetcher::new(
                &descriptor.source,
                "connection refused",
            ))),
        }
    }
}

/// A factory that rejects every descriptor as misconfigured.
pub fn rejecting_factory(descriptor: &RepositoryDescriptor) -> FetcherResult {
    Err(ResolveError::invalid_params(descriptor, "rejected by test"))
}

/// `n` records keyed `{prefix}-{i}`.
pub fn records(prefix: &str, n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            Record::new(
                format!("{prefix}-{i}"),
                serde_json::json!({ "source": prefix, "index": i }),
            )
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Document {
    payload: Payload,
    fingerprint: Fingerprint,
}

/// Canonical store kept in a map, with knobs for injecting failures.
#[derive(Debug, Default)]
pub struct InMemoryCanonicalStore {
    documents: Mutex<BTreeMap<RecordKey, Document>>,
    rejected: Mutex<HashSet<RecordKey>>,
    unavailable: AtomicBool,
    write_limit: Option<usize>,
    writes: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    parked: AtomicUsize,
}

impl InMemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become unavailable once `limit` upserts have succeeded.
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Make every upsert wait for a permit from `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Reject every write to `key`.
    pub fn reject(&self, key: &str) {
        self.lock_rejected().insert(RecordKey::new(key));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Store a document directly, bypassing write accounting.
    pub fn seed(&self, key: &str, payload: Payload) {
        let fingerprint = Fingerprint::of(&payload);
        self.lock_documents().insert(
            RecordKey::new(key),
            Document {
                payload,
                fingerprint,
            },
        );
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Upserts currently waiting on the gate.
    pub fn parked_writers(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock_documents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self, key: &str) -> Option<Payload> {
        self.lock_documents()
            .get(&RecordKey::new(key))
            .map(|doc| doc.payload.clone())
    }

    pub fn stored_keys(&self) -> Vec<String> {
        self.lock_documents()
            .keys()
            .map(|key| key.as_str().to_owned())
            .collect()
    }

    fn check_available(&self) -> Result<(), CanonicalError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CanonicalError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    fn lock_documents(&self) -> std::sync::MutexGuard<'_, BTreeMap<RecordKey, Document>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rejected(&self) -> std::sync::MutexGuard<'_, HashSet<RecordKey>> {
        self.rejected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl CanonicalStore for InMemoryCanonicalStore {
    async fn upsert(
        &self,
        key: &RecordKey,
        payload: &Payload,
        fingerprint: &Fingerprint,
    ) -> Result<(), CanonicalError> {
        if let Some(gate) = &self.gate {
            self.parked.fetch_add(1, Ordering::SeqCst);
            let permit = gate.acquire().await;
            self.parked.fetch_sub(1, Ordering::SeqCst);
            if let Ok(permit) = permit {
                permit.forget();
            }
        }

        self.check_available()?;
        if let Some(limit) = self.write_limit
            && self.writes.load(Ordering::SeqCst) >= limit
        {
            self.set_unavailable(true);
            return self.check_available();
        }
        if self.lock_rejected().contains(key) {
            return Err(CanonicalError::Rejected {
                key: key.clone(),
                reason: "constraint violation".into(),
            });
        }

        self.lock_documents().insert(
            key.clone(),
            Document {
                payload: payload.clone(),
                fingerprint: fingerprint.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_fingerprint(&self, key: &RecordKey) -> Result<Option<Fingerprint>, CanonicalError> {
        self.check_available()?;
        Ok(self
            .lock_documents()
            .get(key)
            .map(|doc| doc.fingerprint.clone()))
    }

    async fn keys(&self) -> Result<Vec<RecordKey>, CanonicalError> {
        self.check_available()?;
        Ok(self.lock_documents().keys().cloned().collect())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), CanonicalError> {
        self.check_available()?;
        if self.lock_rejected().contains(key) {
            return Err(CanonicalError::Rejected {
                key: key.clone(),
                reason: "delete refused".into(),
            });
        }
        self.lock_documents().remove(key);
        Ok(())
    }
}

/// Behavioral checks shared by every storage backend.
///
/// Each check expects a fresh, empty backend.
pub mod storage_conformance {
    use futures::future::join_all;
    use serde_json::json;

    use crate::bucket::BucketId;
    use crate::record::RecordKey;
    use crate::storage::{RecordStorage, StorageError};

    fn key(k: &str) -> RecordKey {
        RecordKey::new(k)
    }

    pub async fn get_returns_what_was_put(storage: &dyn RecordStorage) {
        let bucket = BucketId::new("b1");
        let payload = json!({"code": "CSC108", "sections": [1, 2, 3], "note": "a/b: c"});
        storage.put(&bucket, &key("CSC108"), &payload).await.unwrap();

        assert_eq!(storage.get(&bucket, &key("CSC108")).await.unwrap(), payload);
        assert!(storage.contains(&bucket, &key("CSC108")).await.unwrap());
    }

    pub async fn put_overwrites_without_duplicate_listing(storage: &dyn RecordStorage) {
        let bucket = BucketId::new("b1");
        storage.put(&bucket, &key("k"), &json!(1)).await.unwrap();
        storage.put(&bucket, &key("k"), &json!(2)).await.unwrap();

        assert_eq!(storage.get(&bucket, &key("k")).await.unwrap(), json!(2));
        assert_eq!(storage.list_keys(&bucket).await.unwrap(), vec![key("k")]);
    }

    pub async fn list_keys_keeps_insertion_order(storage: &dyn RecordStorage) {
        let bucket = BucketId::new("b1");
        for k in ["zeta", "alpha", "mid", "alpha"] {
            storage.put(&bucket, &key(k), &json!(k)).await.unwrap();
        }

        assert_eq!(
            storage.list_keys(&bucket).await.unwrap(),
            vec![key("zeta"), key("alpha"), key("mid")]
        );
    }

    pub async fn missing_key_is_not_found(storage: &dyn RecordStorage) {
        let bucket = BucketId::new("b1");
        storage.put(&bucket, &key("present"), &json!(1)).await.unwrap();

        assert!(matches!(
            storage.get(&bucket, &key("absent")).await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(!storage.contains(&bucket, &key("absent")).await.unwrap());
    }

    pub async fn missing_bucket_is_bucket_not_found(storage: &dyn RecordStorage) {
        let bucket = BucketId::new("never-written");

        assert!(matches!(
            storage.get(&bucket, &key("k")).await,
            Err(StorageError::BucketNotFound(_))
        ));
        assert!(matches!(
            storage.list_keys(&bucket).await,
            Err(StorageError::BucketNotFound(_))
        ));
        assert!(matches!(
            storage.delete_bucket(&bucket).await,
            Err(StorageError::BucketNotFound(_))
        ));
        assert!(!storage.contains(&bucket, &key("k")).await.unwrap());
    }

    pub async fn buckets_are_isolated(storage: &dyn RecordStorage) {
        let a = BucketId::new("a");
        let b = BucketId::new("b");
        storage.put(&a, &key("k"), &json!("from a")).await.unwrap();
        storage.put(&b, &key("k"), &json!("from b")).await.unwrap();

        assert_eq!(storage.get(&a, &key("k")).await.unwrap(), json!("from a"));
        assert_eq!(storage.get(&b, &key("k")).await.unwrap(), json!("from b"));

        let mut buckets = storage.list_buckets().await.unwrap();
        buckets.sort();
        assert_eq!(buckets, vec![a, b]);
    }

    pub async fn delete_bucket_removes_records(storage: &dyn RecordStorage) {
        let doomed = BucketId::new("doomed");
        let kept = BucketId::new("kept");
        storage.put(&doomed, &key("k"), &json!(1)).await.unwrap();
        storage.put(&kept, &key("k"), &json!(1)).await.unwrap();

        storage.delete_bucket(&doomed).await.unwrap();

        assert!(matches!(
            storage.get(&doomed, &key("k")).await,
            Err(StorageError::BucketNotFound(_))
        ));
        assert_eq!(storage.list_buckets().await.unwrap(), vec![kept.clone()]);
        assert_eq!(storage.get(&kept, &key("k")).await.unwrap(), json!(1));
    }

    pub async fn unusual_keys_round_trip(storage: &dyn RecordStorage) {
        let bucket = BucketId::new("b1");
        let long = format!("http-json:https://example.edu/{}__CSC108", "x/y?".repeat(75));
        let keys = [
            "repo:a__CSC108/LEC 0101",
            "..",
            "ünïcode",
            "a%2Fb",
            ".keys",
            long.as_str(),
        ];
        for (i, k) in keys.iter().enumerate() {
            storage.put(&bucket, &key(k), &json!(i)).await.unwrap();
        }

        for (i, k) in keys.iter().enumerate() {
            assert_eq!(storage.get(&bucket, &key(k)).await.unwrap(), json!(i));
        }
        assert_eq!(
            storage.list_keys(&bucket).await.unwrap(),
            keys.iter().map(|k| key(k)).collect::<Vec<_>>()
        );
    }

    pub async fn concurrent_writes_to_distinct_keys(storage: &dyn RecordStorage) {
        let bucket = BucketId::new("b1");
        let keys: Vec<RecordKey> = (0..50).map(|i| key(&format!("k{i}"))).collect();

        let payloads: Vec<_> = keys.iter().map(|k| json!(k.as_str())).collect();

        let results = join_all(
            keys.iter()
                .zip(&payloads)
                .map(|(k, payload)| storage.put(&bucket, k, payload)),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));

        let mut listed = storage.list_keys(&bucket).await.unwrap();
        listed.sort();
        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(listed, expected);

        for k in &keys {
            assert_eq!(storage.get(&bucket, k).await.unwrap(), json!(k.as_str()));
        }
    }

    pub async fn delete_removes_key_from_listing(storage: &dyn RecordStorage) {
        let bucket = BucketId::new("b1");
        for k in ["a", "b", "c"] {
            storage.put(&bucket, &key(k), &json!(k)).await.unwrap();
        }

        storage.delete(&bucket, &key("b")).await.unwrap();
        // Absent keys are ignored.
        storage.delete(&bucket, &key("b")).await.unwrap();

        assert_eq!(
            storage.list_keys(&bucket).await.unwrap(),
            vec![key("a"), key("c")]
        );
        assert!(matches!(
            storage.get(&bucket, &key("b")).await,
            Err(StorageError::NotFound { .. })
        ));

        storage.put(&bucket, &key("b"), &json!("again")).await.unwrap();
        assert_eq!(
            storage.list_keys(&bucket).await.unwrap(),
            vec![key("a"), key("c"), key("b")]
        );
        assert!(matches!(
            storage.delete(&BucketId::new("absent"), &key("a")).await,
            Err(StorageError::BucketNotFound(_))
        ));
    }

    pub async fn lock_is_exclusive_until_dropped(storage: &dyn RecordStorage) {
        let lease = storage.try_lock("sync-b1").await.unwrap();
        assert!(lease.is_some());
        assert!(storage.try_lock("sync-b1").await.unwrap().is_none());
        assert!(storage.try_lock("sync-b2").await.unwrap().is_some());

        drop(lease);
        assert!(storage.try_lock("sync-b1").await.unwrap().is_some());
    }
}
