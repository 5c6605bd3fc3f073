use anyhow::Result;
use gator::{BucketRef, SyncEngine};

/// Delete canonical documents whose keys are absent from the bucket.
pub async fn run(engine: &SyncEngine<'_>, target: &BucketRef) -> Result<()> {
    let report = engine.prune(target).await?;

    println!(
        "Pruned against bucket {}: {} deleted, {} kept, {} failed.",
        report.bucket_id,
        report.deleted,
        report.kept,
        report.failures.len()
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.key, failure.reason);
    }
    Ok(())
}
