use anyhow::{Context, Result};
use gator::{BucketManager, BucketRef, RecordKey};

pub async fn list(buckets: &BucketManager, target: &BucketRef) -> Result<()> {
    let bucket = buckets.resolve(target).await?;
    let keys = buckets.records(&bucket.id).await?;

    for key in &keys {
        println!("{key}");
    }
    eprintln!("{} records in bucket {}", keys.len(), bucket.id);
    Ok(())
}

pub async fn show(buckets: &BucketManager, target: &BucketRef, key: &str) -> Result<()> {
    let bucket = buckets.resolve(target).await?;
    let payload = buckets.record(&bucket.id, &RecordKey::new(key)).await?;

    let pretty = serde_json::to_string_pretty(&payload).context("failed to render payload")?;
    println!("{pretty}");
    Ok(())
}
