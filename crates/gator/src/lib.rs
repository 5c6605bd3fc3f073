pub mod bucket;
pub mod canonical;
pub mod fetcher;
pub mod memory;
pub mod pull;
pub mod record;
pub mod registry;
pub mod repolist;
pub mod storage;
pub mod sync;

pub use bucket::{
    Bucket, BucketError, BucketId, BucketManager, BucketRef, METADATA_BUCKET, PendingBucket,
    RepositoryOutcome, RepositoryReport,
};
pub use canonical::{CanonicalError, CanonicalStore};
pub use fetcher::{DatasetFetcher, FetchError};
pub use memory::MemoryStorage;
pub use pull::{PullError, PullOptions, PullOrchestrator};
pub use record::{Fingerprint, KEY_SEPARATOR, Payload, Record, RecordKey};
pub use registry::{FetcherFactory, FetcherRegistry, FetcherResult, ResolveError};
pub use repolist::{ConfigurationError, Repolist, RepositoryDescriptor, RepositoryEntry};
pub use storage::{RecordStorage, StorageError, StorageLease};
pub use sync::{
    DEFAULT_CONCURRENCY, FailedKey, PruneReport, SyncEngine, SyncError, SyncOptions, SyncReport,
};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
