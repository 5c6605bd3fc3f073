use std::sync::Arc;

use crate::record::Record;

/// Errors a dataset can raise while fetching its repository.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

/// Knows how to pull every record out of one configured repository.
///
/// Implementations own their transport, paging, parsing and timeouts; the
/// pull pipeline only sees the resulting records.
#[async_trait::async_trait]
pub trait DatasetFetcher: Send + Sync {
    /// Human-readable label identifying what is being fetched.
    fn label(&self) -> &str;

    /// Fetch all records from the repository.
    async fn fetch(&self) -> Result<Vec<Record>, FetchError>;
}

#[async_trait::async_trait]
impl<T: DatasetFetcher + ?Sized> DatasetFetcher for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        (**self).fetch().await
    }
}

#[async_trait::async_trait]
impl<T: DatasetFetcher + ?Sized> DatasetFetcher for Box<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        (**self).fetch().await
    }
}
