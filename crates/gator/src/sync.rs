//! Reconciling a bucket into the canonical store.
//!
//! Sync is fingerprint driven and additive: keys whose stored fingerprint
//! matches the bucket are skipped, and canonical keys absent from the bucket
//! are left alone. Removing those is the separate, explicit [`SyncEngine::prune`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bucket::{BucketError, BucketId, BucketManager, BucketRef};
use crate::canonical::{CanonicalError, CanonicalStore};
use crate::record::{Fingerprint, RecordKey};
use crate::storage::StorageLease;

/// Default number of keys reconciled concurrently.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Storage lock name prefix for runs against one bucket.
const RUN_LOCK_PREFIX: &str = "sync-";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Bucket(#[from] BucketError),

    #[error("bucket {0} is already being synced or pruned")]
    AlreadyRunning(BucketId),

    /// The canonical store went away mid-run. Writes made before the failure
    /// are kept and counted in `partial`.
    #[error("canonical store unavailable: {reason}")]
    StoreUnavailable {
        reason: String,
        partial: Box<SyncReport>,
    },

    #[error("prune interrupted after {deleted} deletions: {reason}")]
    PruneInterrupted { reason: String, deleted: usize },
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Rewrite keys even when their fingerprint already matches.
    pub force: bool,
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// A key the engine could not write, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedKey {
    pub key: RecordKey,
    pub reason: String,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub bucket_id: BucketId,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failures: Vec<FailedKey>,
}

impl SyncReport {
    fn new(bucket_id: BucketId) -> Self {
        Self {
            bucket_id,
            inserted: 0,
            updated: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Keys the run wrote to the canonical store.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    fn record(&mut self, outcome: KeyOutcome) {
        match outcome {
            KeyOutcome::Inserted => self.inserted += 1,
            KeyOutcome::Updated => self.updated += 1,
            KeyOutcome::Skipped => self.skipped += 1,
            KeyOutcome::Failed(failure) => self.failures.push(failure),
            KeyOutcome::Unavailable(_) | KeyOutcome::Halted => {}
        }
    }
}

/// Outcome of one prune run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub bucket_id: BucketId,
    pub deleted: usize,
    pub kept: usize,
    pub failures: Vec<FailedKey>,
}

enum KeyOutcome {
    Inserted,
    Updated,
    Skipped,
    Failed(FailedKey),
    Unavailable(String),
    /// Not attempted because the store already went away.
    Halted,
}

/// Reconciles buckets into a canonical store.
///
/// Runs against one bucket exclude each other through a lock in the record
/// storage, so the exclusion holds across engines and, for the disk backend,
/// across processes.
pub struct SyncEngine<'a> {
    buckets: &'a BucketManager,
    store: &'a dyn CanonicalStore,
}

impl<'a> SyncEngine<'a> {
    pub fn new(buckets: &'a BucketManager, store: &'a dyn CanonicalStore) -> Self {
        Self { buckets, store }
    }

    pub async fn sync(
        &self,
        target: &BucketRef,
        options: &SyncOptions,
    ) -> Result<SyncReport, SyncError> {
        let bucket = self.buckets.resolve(target).await?;
        let _run = self.start(&bucket.id).await?;

        if matches!(target, BucketRef::Id(_))
            && let Ok(latest) = self.buckets.latest().await
            && latest.id != bucket.id
        {
            warn!(
                bucket_id = %bucket.id,
                latest = %latest.id,
                "syncing a bucket that is not the latest"
            );
        }

        let keys = self.buckets.records(&bucket.id).await?;
        info!(
            bucket_id = %bucket.id,
            keys = keys.len(),
            force = options.force,
            "starting sync"
        );

        let mut report = SyncReport::new(bucket.id.clone());
        let halted = AtomicBool::new(false);
        let mut unavailable = None;

        // After an outage no new key is started, but writes already in
        // flight are drained so the partial report counts them.
        let mut outcomes = stream::iter(keys)
            .map(|key| self.sync_key(&bucket.id, key, options.force, &halted))
            .buffer_unordered(options.concurrency.max(1));

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                KeyOutcome::Unavailable(reason) if unavailable.is_none() => {
                    halted.store(true, Ordering::SeqCst);
                    warn!(
                        bucket_id = %bucket.id,
                        %reason,
                        "canonical store unavailable, aborting sync"
                    );
                    unavailable = Some(reason);
                }
                outcome => report.record(outcome),
            }
        }

        report.failures.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(reason) = unavailable {
            return Err(SyncError::StoreUnavailable {
                reason,
                partial: Box::new(report),
            });
        }
        info!(
            bucket_id = %bucket.id,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed(),
            "finished sync"
        );
        Ok(report)
    }

    async fn sync_key(
        &self,
        bucket: &BucketId,
        key: RecordKey,
        force: bool,
        halted: &AtomicBool,
    ) -> KeyOutcome {
        if halted.load(Ordering::SeqCst) {
            return KeyOutcome::Halted;
        }

        let payload = match self.buckets.read_record(bucket, &key).await {
            Ok(payload) => payload,
            Err(e) => {
                return KeyOutcome::Failed(FailedKey {
                    key,
                    reason: e.to_string(),
                });
            }
        };
        let fingerprint = Fingerprint::of(&payload);

        let stored = match self.store.get_fingerprint(&key).await {
            Ok(stored) => stored,
            Err(e) => return failure(key, e),
        };

        let outcome = match stored {
            None => KeyOutcome::Inserted,
            Some(existing) if existing == fingerprint && !force => {
                debug!(%key, "unchanged");
                return KeyOutcome::Skipped;
            }
            Some(_) => KeyOutcome::Updated,
        };

        if halted.load(Ordering::SeqCst) {
            return KeyOutcome::Halted;
        }

        match self.store.upsert(&key, &payload, &fingerprint).await {
            Ok(()) => {
                debug!(
                    %key,
                    inserted = matches!(outcome, KeyOutcome::Inserted),
                    "wrote document"
                );
                outcome
            }
            Err(e) => failure(key, e),
        }
    }

    /// Delete canonical keys that are not present in the target bucket.
    pub async fn prune(&self, target: &BucketRef) -> Result<PruneReport, SyncError> {
        let bucket = self.buckets.resolve(target).await?;
        let _run = self.start(&bucket.id).await?;

        let wanted: HashSet<RecordKey> = self
            .buckets
            .records(&bucket.id)
            .await?
            .into_iter()
            .collect();

        let existing = self
            .store
            .keys()
            .await
            .map_err(|e| SyncError::PruneInterrupted {
                reason: e.to_string(),
                deleted: 0,
            })?;

        let mut report = PruneReport {
            bucket_id: bucket.id.clone(),
            deleted: 0,
            kept: 0,
            failures: Vec::new(),
        };

        for key in existing {
            if wanted.contains(&key) {
                report.kept += 1;
                continue;
            }
            match self.store.delete(&key).await {
                Ok(()) => {
                    debug!(%key, "pruned document");
                    report.deleted += 1;
                }
                Err(CanonicalError::Unavailable(reason)) => {
                    return Err(SyncError::PruneInterrupted {
                        reason,
                        deleted: report.deleted,
                    });
                }
                Err(e) => report.failures.push(FailedKey {
                    key,
                    reason: e.to_string(),
                }),
            }
        }

        info!(
            bucket_id = %bucket.id,
            deleted = report.deleted,
            kept = report.kept,
            failed = report.failures.len(),
            "finished prune"
        );
        Ok(report)
    }

    /// Take the run lock for a bucket. The lock is released when the
    /// returned lease drops.
    async fn start(&self, id: &BucketId) -> Result<StorageLease, SyncError> {
        self.buckets
            .storage()
            .try_lock(&format!("{RUN_LOCK_PREFIX}{id}"))
            .await
            .map_err(BucketError::from)?
            .ok_or_else(|| SyncError::AlreadyRunning(id.clone()))
    }
}

fn failure(key: RecordKey, error: CanonicalError) -> KeyOutcome {
    match error {
        CanonicalError::Unavailable(reason) => KeyOutcome::Unavailable(reason),
        other => {
            warn!(%key, error = %other, "failed to sync key");
            KeyOutcome::Failed(FailedKey {
                key,
                reason: other.to_string(),
            })
        }
    }
}
