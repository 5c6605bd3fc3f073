use anyhow::Result;
use gator::{BucketId, BucketManager, BucketRef};

use super::format;

pub async fn list(buckets: &BucketManager) -> Result<()> {
    let sealed = buckets.sealed_buckets().await?;
    if sealed.is_empty() {
        println!("No buckets.");
        return Ok(());
    }

    let latest = buckets.latest().await.ok().map(|bucket| bucket.id);
    for bucket in &sealed {
        let marker = if latest.as_ref() == Some(&bucket.id) {
            "  (latest)"
        } else {
            ""
        };
        println!(
            "{}  {}  {:>8} records  {} failed{marker}",
            bucket.id,
            format::timestamp(bucket.created_at),
            bucket.record_count,
            bucket.failed_repositories().count(),
        );
    }
    println!("\n{} buckets", sealed.len());
    Ok(())
}

pub async fn show(buckets: &BucketManager, target: &BucketRef) -> Result<()> {
    let bucket = buckets.resolve(target).await?;
    format::print_bucket(&bucket);
    Ok(())
}

pub async fn delete(buckets: &BucketManager, id: &str) -> Result<()> {
    let id = BucketId::new(id);
    buckets.delete(&id).await?;
    println!("Deleted bucket {id}.");
    Ok(())
}

/// Discard buckets left unsealed by interrupted pulls.
pub async fn gc(buckets: &BucketManager) -> Result<()> {
    let discarded = buckets.discard_incomplete().await?;
    for id in &discarded {
        println!("Discarded {id}");
    }
    println!("{} unsealed buckets discarded.", discarded.len());
    Ok(())
}
