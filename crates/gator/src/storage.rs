use std::any::Any;
use std::sync::Arc;

use crate::bucket::BucketId;
use crate::record::{Payload, RecordKey};

/// Errors that can occur when reading or writing raw record payloads.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("bucket not found: {0}")]
    BucketNotFound(BucketId),

    #[error("record {key} not found in bucket {bucket}")]
    NotFound { bucket: BucketId, key: RecordKey },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Exclusive hold on a named storage lock. Dropping it releases the lock.
pub struct StorageLease {
    _held: Box<dyn Any + Send + Sync>,
}

impl StorageLease {
    /// Wrap a backend-specific value whose `Drop` releases the lock.
    pub fn new(held: impl Any + Send + Sync) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for StorageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageLease")
    }
}

/// Key/value persistence for raw pulled payloads, addressed by bucket id
/// and record key.
///
/// Implementations must make writes visible to subsequent reads in the same
/// process, accept concurrent writes to distinct keys of one bucket, and
/// overwrite on a repeated `(bucket, key)` write without listing the key
/// twice. Buckets are created implicitly by their first `put`.
#[async_trait::async_trait]
pub trait RecordStorage: Send + Sync {
    /// Short name of the backend, for logs.
    fn backend(&self) -> &str;

    /// Store a payload, replacing any previous payload under the same key.
    async fn put(
        &self,
        bucket: &BucketId,
        key: &RecordKey,
        payload: &Payload,
    ) -> Result<(), StorageError>;

    /// Read a payload back.
    async fn get(&self, bucket: &BucketId, key: &RecordKey) -> Result<Payload, StorageError>;

    /// Whether a payload exists under the key. Absent buckets hold no keys.
    async fn contains(&self, bucket: &BucketId, key: &RecordKey) -> Result<bool, StorageError>;

    /// Keys of a bucket in insertion order. Calling this again yields the
    /// same order.
    async fn list_keys(&self, bucket: &BucketId) -> Result<Vec<RecordKey>, StorageError>;

    /// All physical buckets, in arbitrary order.
    async fn list_buckets(&self) -> Result<Vec<BucketId>, StorageError>;

    /// Remove one payload and its listing entry. Removing an absent key
    /// from an existing bucket is not an error.
    async fn delete(&self, bucket: &BucketId, key: &RecordKey) -> Result<(), StorageError>;

    /// Remove a bucket and all of its payloads.
    async fn delete_bucket(&self, bucket: &BucketId) -> Result<(), StorageError>;

    /// Take the named lock, or `None` if someone else holds it. The lock is
    /// shared by every user of the same storage, across processes for
    /// persistent backends.
    async fn try_lock(&self, name: &str) -> Result<Option<StorageLease>, StorageError>;
}

#[async_trait::async_trait]
impl<T: RecordStorage + ?Sized> RecordStorage for Arc<T> {
    fn backend(&self) -> &str {
        (**self).backend()
    }

    async fn put(
        &self,
        bucket: &BucketId,
        key: &RecordKey,
        payload: &Payload,
    ) -> Result<(), StorageError> {
        (**self).put(bucket, key, payload).await
    }

    async fn get(&self, bucket: &BucketId, key: &RecordKey) -> Result<Payload, StorageError> {
        (**self).get(bucket, key).await
    }

    async fn contains(&self, bucket: &BucketId, key: &RecordKey) -> Result<bool, StorageError> {
        (**self).contains(bucket, key).await
    }

    async fn list_keys(&self, bucket: &BucketId) -> Result<Vec<RecordKey>, StorageError> {
        (**self).list_keys(bucket).await
    }

    async fn list_buckets(&self) -> Result<Vec<BucketId>, StorageError> {
        (**self).list_buckets().await
    }

    async fn delete(&self, bucket: &BucketId, key: &RecordKey) -> Result<(), StorageError> {
        (**self).delete(bucket, key).await
    }

    async fn delete_bucket(&self, bucket: &BucketId) -> Result<(), StorageError> {
        (**self).delete_bucket(bucket).await
    }

    async fn try_lock(&self, name: &str) -> Result<Option<StorageLease>, StorageError> {
        (**self).try_lock(name).await
    }
}
