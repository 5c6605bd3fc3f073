//! Pulling every configured repository into a fresh bucket.
//!
//! A pull never fails because one repository failed: resolve errors, fetch
//! errors and storage errors for a repository are folded into that
//! repository's [`RepositoryReport`] and the bucket is sealed regardless.
//! Only bucket bookkeeping failures abort a pull, and those leave an
//! unsealed bucket that [`BucketManager::discard_incomplete`] cleans up.

use std::collections::HashSet;

use futures::future::join_all;
use tracing::{info, warn};

use crate::bucket::{
    Bucket, BucketError, BucketManager, PendingBucket, RepositoryOutcome, RepositoryReport,
};
use crate::record::{KEY_SEPARATOR, RecordKey};
use crate::registry::FetcherRegistry;
use crate::repolist::RepositoryDescriptor;

/// Errors that abort a whole pull.
#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error(transparent)]
    Bucket(#[from] BucketError),
}

/// Optional restrictions on a pull.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// When non-empty, only repositories with these ids are pulled.
    pub only: Vec<String>,
}

impl PullOptions {
    fn includes(&self, descriptor: &RepositoryDescriptor) -> bool {
        self.only.is_empty() || self.only.iter().any(|id| id == &descriptor.id)
    }
}

/// Fetches configured repositories into new buckets.
pub struct PullOrchestrator<'a> {
    buckets: &'a BucketManager,
    registry: &'a FetcherRegistry,
}

impl<'a> PullOrchestrator<'a> {
    pub fn new(buckets: &'a BucketManager, registry: &'a FetcherRegistry) -> Self {
        Self { buckets, registry }
    }

    /// Pull every enabled descriptor into a new sealed bucket.
    pub async fn pull(&self, descriptors: &[RepositoryDescriptor]) -> Result<Bucket, PullError> {
        self.pull_with(descriptors, &PullOptions::default()).await
    }

    pub async fn pull_with(
        &self,
        descriptors: &[RepositoryDescriptor],
        options: &PullOptions,
    ) -> Result<Bucket, PullError> {
        let selected: Vec<&RepositoryDescriptor> = descriptors
            .iter()
            .filter(|d| d.enabled && options.includes(d))
            .collect();

        let pending = self.buckets.begin().await?;
        info!(
            bucket_id = %pending.id(),
            repositories = selected.len(),
            "starting pull"
        );

        // Repositories are independent and write disjoint keys, so they are
        // fetched concurrently. join_all keeps configuration order.
        let reports = join_all(
            selected
                .iter()
                .map(|descriptor| self.pull_repository(&pending, descriptor)),
        )
        .await;

        let bucket = pending.seal(reports).await?;

        let failed = bucket.failed_repositories().count();
        info!(
            bucket_id = %bucket.id,
            records = bucket.record_count,
            failed,
            "finished pull"
        );
        Ok(bucket)
    }

    async fn pull_repository(
        &self,
        bucket: &PendingBucket<'_>,
        descriptor: &RepositoryDescriptor,
    ) -> RepositoryReport {
        let mut report = RepositoryReport {
            repository: descriptor.id.clone(),
            dataset_type: descriptor.dataset_type.clone(),
            source: descriptor.source.clone(),
            outcome: RepositoryOutcome::Succeeded { records: 0 },
            warnings: Vec::new(),
        };

        if descriptor.id.contains(KEY_SEPARATOR) {
            warn!(repository = %descriptor.id, "repository id contains the key separator");
            report.outcome = RepositoryOutcome::Failed {
                error: format!("repository id must not contain `{KEY_SEPARATOR}`"),
                records_written: 0,
            };
            return report;
        }

        let fetcher = match self.registry.resolve(descriptor) {
            Ok(fetcher) => fetcher,
            Err(e) => {
                warn!(repository = %descriptor.id, error = %e, "skipping repository");
                report.outcome = RepositoryOutcome::Failed {
                    error: e.to_string(),
                    records_written: 0,
                };
                return report;
            }
        };

        let records = match fetcher.fetch().await {
            Ok(records) => records,
            Err(e) => {
                warn!(repository = %descriptor.id, error = %e, "fetch failed");
                report.outcome = RepositoryOutcome::Failed {
                    error: e.to_string(),
                    records_written: 0,
                };
                return report;
            }
        };

        let mut written: HashSet<RecordKey> = HashSet::with_capacity(records.len());
        for record in &records {
            let key = RecordKey::namespaced(&descriptor.id, record.key());

            if let Err(e) = bucket.put(&key, record.payload()).await {
                warn!(repository = %descriptor.id, %key, error = %e, "failed to store record");
                report.outcome = RepositoryOutcome::Failed {
                    error: format!("storage error: {e}"),
                    records_written: written.len(),
                };
                return report;
            }

            if !written.insert(key) {
                warn!(repository = %descriptor.id, key = %record.key(), "duplicate record key");
                report
                    .warnings
                    .push(format!("duplicate record key {}", record.key()));
            }
        }

        info!(
            repository = %descriptor.id,
            records = written.len(),
            "fetched repository"
        );
        report.outcome = RepositoryOutcome::Succeeded {
            records: written.len(),
        };
        report
    }
}
