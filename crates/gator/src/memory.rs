use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bucket::BucketId;
use crate::record::{Payload, RecordKey};
use crate::storage::{RecordStorage, StorageError, StorageLease};

#[derive(Default)]
struct MemoryBucket {
    order: Vec<RecordKey>,
    payloads: HashMap<RecordKey, Payload>,
}

/// Volatile record storage. Everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
    buckets: Mutex<HashMap<BucketId, MemoryBucket>>,
    locks: Arc<Mutex<HashSet<String>>>,
}

/// Removes its name from the held set on drop.
struct MemoryLease {
    locks: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BucketId, MemoryBucket>> {
        // No mutation panics midway, so a poisoned map is still consistent.
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl RecordStorage for MemoryStorage {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn put(
        &self,
        bucket: &BucketId,
        key: &RecordKey,
        payload: &Payload,
    ) -> Result<(), StorageError> {
        let mut buckets = self.lock();
        let entry = buckets.entry(bucket.clone()).or_default();
        if entry
            .payloads
            .insert(key.clone(), payload.clone())
            .is_none()
        {
            entry.order.push(key.clone());
        }
        Ok(())
    }

    async fn get(&self, bucket: &BucketId, key: &RecordKey) -> Result<Payload, StorageError> {
        let buckets = self.lock();
        let entry = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.clone()))?;

        entry
            .payloads
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.clone(),
                key: key.clone(),
            })
    }

    async fn contains(&self, bucket: &BucketId, key: &RecordKey) -> Result<bool, StorageError> {
        Ok(self
            .lock()
            .get(bucket)
            .is_some_and(|entry| entry.payloads.contains_key(key)))
    }

    async fn list_keys(&self, bucket: &BucketId) -> Result<Vec<RecordKey>, StorageError> {
        self.lock()
            .get(bucket)
            .map(|entry| entry.order.clone())
            .ok_or_else(|| StorageError::BucketNotFound(bucket.clone()))
    }

    async fn list_buckets(&self) -> Result<Vec<BucketId>, StorageError> {
        Ok(self.lock().keys().cloned().collect())
    }

    async fn delete(&self, bucket: &BucketId, key: &RecordKey) -> Result<(), StorageError> {
        let mut buckets = self.lock();
        let entry = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.clone()))?;
        if entry.payloads.remove(key).is_some() {
            entry.order.retain(|k| k != key);
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &BucketId) -> Result<(), StorageError> {
        self.lock()
            .remove(bucket)
            .map(|_| ())
            .ok_or_else(|| StorageError::BucketNotFound(bucket.clone()))
    }

    async fn try_lock(&self, name: &str) -> Result<Option<StorageLease>, StorageError> {
        let mut held = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(name.to_owned()) {
            return Ok(None);
        }
        Ok(Some(StorageLease::new(MemoryLease {
            locks: Arc::clone(&self.locks),
            name: name.to_owned(),
        })))
    }
}
