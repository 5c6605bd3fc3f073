use std::collections::HashMap;
use std::sync::Arc;

use gator::test_support::{self, InMemoryCanonicalStore};
use gator::{
    Bucket, BucketError, BucketId, BucketManager, BucketRef, FetcherRegistry, MemoryStorage,
    PullOrchestrator, Record, RepositoryDescriptor, SyncEngine, SyncError, SyncOptions,
};
use serde_json::json;
use tokio::sync::Semaphore;

fn manager() -> BucketManager {
    BucketManager::new(Arc::new(MemoryStorage::new()))
}

async fn pull(buckets: &BucketManager, sources: &[(&str, Vec<Record>)]) -> Bucket {
    let canned: HashMap<String, Vec<Record>> = sources
        .iter()
        .map(|(source, records)| (source.to_string(), records.clone()))
        .collect();
    let mut registry = FetcherRegistry::new();
    registry.register("timetable", test_support::static_sources(canned));

    let descriptors: Vec<_> = sources
        .iter()
        .map(|(source, _)| RepositoryDescriptor::new("timetable", *source))
        .collect();

    PullOrchestrator::new(buckets, &registry)
        .pull(&descriptors)
        .await
        .unwrap()
}

#[tokio::test]
async fn end_to_end_pull_then_sync_inserts_everything() {
    let buckets = manager();
    let bucket = pull(
        &buckets,
        &[
            ("repoA", test_support::records("a", 3)),
            ("repoB", test_support::records("b", 2)),
        ],
    )
    .await;
    assert_eq!(bucket.record_count, 5);
    assert!(bucket.repositories.iter().all(|r| r.outcome.is_success()));

    let store = InMemoryCanonicalStore::new();
    let engine = SyncEngine::new(&buckets, &store);
    let report = engine
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.bucket_id, bucket.id);
    assert_eq!(report.inserted, 5);
    assert_eq!(report.updated, 0);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.failed(), 0);
    assert_eq!(store.len(), 5);
    assert_eq!(
        store.payload("timetable:repoA__a-1"),
        Some(json!({"source": "a", "index": 1}))
    );
}

#[tokio::test]
async fn second_sync_is_a_no_op() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 4))]).await;

    let store = InMemoryCanonicalStore::new();
    let engine = SyncEngine::new(&buckets, &store);
    engine
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();
    let writes_after_first = store.write_count();

    let second = engine
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 4);
    assert_eq!(second.failed(), 0);
    assert_eq!(store.write_count(), writes_after_first);
}

#[tokio::test]
async fn changed_payload_is_updated_exactly_once() {
    let buckets = manager();
    let store = InMemoryCanonicalStore::new();

    pull(
        &buckets,
        &[(
            "repoA",
            vec![
                Record::new("same", json!({"n": 1})),
                Record::new("changes", json!({"n": 1})),
            ],
        )],
    )
    .await;
    SyncEngine::new(&buckets, &store)
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();
    let writes_before = store.write_count();

    pull(
        &buckets,
        &[(
            "repoA",
            vec![
                Record::new("same", json!({"n": 1})),
                Record::new("changes", json!({"n": 2})),
            ],
        )],
    )
    .await;
    let report = SyncEngine::new(&buckets, &store)
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.inserted, 0);
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(store.write_count(), writes_before + 1);
    assert_eq!(
        store.payload("timetable:repoA__changes"),
        Some(json!({"n": 2}))
    );
}

#[tokio::test]
async fn force_rewrites_unchanged_keys() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 3))]).await;

    let store = InMemoryCanonicalStore::new();
    let engine = SyncEngine::new(&buckets, &store);
    engine
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();

    let forced = engine
        .sync(
            &BucketRef::Latest,
            &SyncOptions {
                force: true,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(forced.updated, 3);
    assert_eq!(forced.skipped, 0);
    assert_eq!(store.write_count(), 6);
}

#[tokio::test]
async fn rejected_key_is_reported_and_others_still_sync() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 3))]).await;

    let store = InMemoryCanonicalStore::new();
    store.reject("timetable:repoA__a-1");

    let report = SyncEngine::new(&buckets, &store)
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.inserted, 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.failures[0].key.as_str(), "timetable:repoA__a-1");
    assert!(report.failures[0].reason.contains("constraint violation"));
}

#[tokio::test]
async fn sync_leaves_keys_missing_from_bucket_untouched() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 1))]).await;

    let store = InMemoryCanonicalStore::new();
    store.seed("retired", json!({"old": true}));

    SyncEngine::new(&buckets, &store)
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(store.payload("retired"), Some(json!({"old": true})));
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn unknown_bucket_fails() {
    let buckets = manager();
    let store = InMemoryCanonicalStore::new();
    let engine = SyncEngine::new(&buckets, &store);

    let result = engine
        .sync(
            &BucketRef::Id(BucketId::new("does-not-exist")),
            &SyncOptions::default(),
        )
        .await;
    assert!(matches!(
        result,
        Err(SyncError::Bucket(BucketError::NotFound(_)))
    ));

    let result = engine
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(SyncError::Bucket(BucketError::NoBucketsExist))
    ));
}

#[tokio::test]
async fn store_outage_aborts_with_partial_report() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 5))]).await;

    let store = InMemoryCanonicalStore::new().with_write_limit(2);
    let result = SyncEngine::new(&buckets, &store)
        .sync(
            &BucketRef::Latest,
            &SyncOptions {
                concurrency: 1,
                ..SyncOptions::default()
            },
        )
        .await;

    match result {
        Err(SyncError::StoreUnavailable { partial, .. }) => {
            assert_eq!(partial.inserted, 2);
            assert_eq!(partial.failed(), 0);
        }
        other => panic!("expected StoreUnavailable, got {other:?}"),
    }
    // Writes made before the outage are kept.
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn store_down_from_the_start_aborts_without_writes() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 3))]).await;

    let store = InMemoryCanonicalStore::new();
    store.set_unavailable(true);

    let result = SyncEngine::new(&buckets, &store)
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await;

    assert!(matches!(result, Err(SyncError::StoreUnavailable { .. })));
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn concurrent_sync_of_same_bucket_is_rejected() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 1))]).await;

    let gate = Arc::new(Semaphore::new(0));
    let store = InMemoryCanonicalStore::new().with_gate(gate.clone());
    let engine = SyncEngine::new(&buckets, &store);

    let target = BucketRef::Latest;
    let options = SyncOptions::default();

    let first = engine.sync(&target, &options);
    let second = async {
        while store.parked_writers() == 0 {
            tokio::task::yield_now().await;
        }
        let result = engine.sync(&target, &options).await;
        gate.add_permits(1);
        result
    };

    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().inserted, 1);
    assert!(matches!(second, Err(SyncError::AlreadyRunning(_))));

    // The lock is released once the first run finishes.
    gate.add_permits(10);
    assert!(
        engine
            .sync(&BucketRef::Latest, &SyncOptions::default())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn separate_engines_do_not_sync_the_same_bucket_at_once() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 2))]).await;

    let gate = Arc::new(Semaphore::new(0));
    let store = InMemoryCanonicalStore::new().with_gate(gate.clone());
    let first_engine = SyncEngine::new(&buckets, &store);
    let second_engine = SyncEngine::new(&buckets, &store);

    let target = BucketRef::Latest;
    let options = SyncOptions::default();

    let first = first_engine.sync(&target, &options);
    let second = async {
        while store.parked_writers() == 0 {
            tokio::task::yield_now().await;
        }
        let result = second_engine.sync(&target, &options).await;
        gate.add_permits(10);
        result
    };

    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().inserted, 2);
    assert!(matches!(second, Err(SyncError::AlreadyRunning(_))));
    assert_eq!(store.write_count(), 2);

    // Pruning takes the same lock, and it is free again.
    assert!(second_engine.prune(&BucketRef::Latest).await.is_ok());
}

#[tokio::test]
async fn outage_report_counts_writes_already_in_flight() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 8))]).await;

    let gate = Arc::new(Semaphore::new(0));
    let store = InMemoryCanonicalStore::new()
        .with_write_limit(2)
        .with_gate(gate.clone());
    let engine = SyncEngine::new(&buckets, &store);

    let options = SyncOptions {
        concurrency: 4,
        ..SyncOptions::default()
    };
    let run = engine.sync(&BucketRef::Latest, &options);
    let release = async {
        while store.parked_writers() < 4 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(100);
    };

    let (result, ()) = tokio::join!(run, release);

    match result {
        Err(SyncError::StoreUnavailable { partial, .. }) => {
            assert_eq!(store.write_count(), 2);
            assert_eq!(partial.inserted, store.write_count());
            assert_eq!(partial.failed(), 0);
        }
        other => panic!("expected StoreUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn older_bucket_can_still_be_synced() {
    let buckets = manager();
    let older = pull(&buckets, &[("repoA", vec![Record::new("k", json!(1))])]).await;
    pull(&buckets, &[("repoA", vec![Record::new("k", json!(2))])]).await;

    let store = InMemoryCanonicalStore::new();
    let engine = SyncEngine::new(&buckets, &store);
    engine
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();

    let report = engine
        .sync(&BucketRef::Id(older.id.clone()), &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(store.payload("timetable:repoA__k"), Some(json!(1)));
}

#[tokio::test]
async fn prune_removes_only_keys_absent_from_bucket() {
    let buckets = manager();
    let bucket = pull(&buckets, &[("repoA", test_support::records("a", 2))]).await;

    let store = InMemoryCanonicalStore::new();
    let engine = SyncEngine::new(&buckets, &store);
    engine
        .sync(&BucketRef::Latest, &SyncOptions::default())
        .await
        .unwrap();
    store.seed("stale-1", json!(1));
    store.seed("stale-2", json!(2));

    let report = engine.prune(&BucketRef::Latest).await.unwrap();

    assert_eq!(report.bucket_id, bucket.id);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.kept, 2);
    assert!(report.failures.is_empty());
    assert_eq!(
        store.stored_keys(),
        vec!["timetable:repoA__a-0", "timetable:repoA__a-1"]
    );
}

#[tokio::test]
async fn prune_reports_refused_deletes() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 1))]).await;

    let store = InMemoryCanonicalStore::new();
    store.seed("stale", json!(1));
    store.seed("protected", json!(1));
    store.reject("protected");

    let report = SyncEngine::new(&buckets, &store)
        .prune(&BucketRef::Latest)
        .await
        .unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key.as_str(), "protected");
    assert!(store.payload("protected").is_some());
}

#[tokio::test]
async fn prune_against_unavailable_store_is_interrupted() {
    let buckets = manager();
    pull(&buckets, &[("repoA", test_support::records("a", 1))]).await;

    let store = InMemoryCanonicalStore::new();
    store.set_unavailable(true);

    let result = SyncEngine::new(&buckets, &store)
        .prune(&BucketRef::Latest)
        .await;
    assert!(matches!(
        result,
        Err(SyncError::PruneInterrupted { deleted: 0, .. })
    ));
}
