use std::sync::Arc;

use crate::record::{Fingerprint, Payload, RecordKey};

/// Errors raised by the canonical document store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalError {
    /// The store cannot be reached at all. Callers stop issuing work.
    #[error("canonical store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected an operation on one key.
    #[error("write rejected for {key}: {reason}")]
    Rejected { key: RecordKey, reason: String },

    #[error("{0}")]
    Other(String),
}

impl CanonicalError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Point reads and writes against the externally owned document store.
///
/// Only the sync engine writes through this interface. Query logic lives
/// with the store's consumers.
#[async_trait::async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Insert or replace the document stored under `key`.
    async fn upsert(
        &self,
        key: &RecordKey,
        payload: &Payload,
        fingerprint: &Fingerprint,
    ) -> Result<(), CanonicalError>;

    /// Fingerprint of the version currently stored, if any.
    async fn get_fingerprint(&self, key: &RecordKey) -> Result<Option<Fingerprint>, CanonicalError>;

    /// Every key currently stored.
    async fn keys(&self) -> Result<Vec<RecordKey>, CanonicalError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &RecordKey) -> Result<(), CanonicalError>;
}

#[async_trait::async_trait]
impl<T: CanonicalStore + ?Sized> CanonicalStore for Arc<T> {
    async fn upsert(
        &self,
        key: &RecordKey,
        payload: &Payload,
        fingerprint: &Fingerprint,
    ) -> Result<(), CanonicalError> {
        (**self).upsert(key, payload, fingerprint).await
    }

    async fn get_fingerprint(&self, key: &RecordKey) -> Result<Option<Fingerprint>, CanonicalError> {
        (**self).get_fingerprint(key).await
    }

    async fn keys(&self) -> Result<Vec<RecordKey>, CanonicalError> {
        (**self).keys().await
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), CanonicalError> {
        (**self).delete(key).await
    }
}
