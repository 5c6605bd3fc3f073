use anyhow::Result;
use gator::{BucketManager, FetcherRegistry, PullOptions, PullOrchestrator, Repolist};

use super::format;

/// Pull every enabled repository into a new bucket and print the outcome.
///
/// Failed repositories are reported but do not make the command fail; the
/// bucket is sealed either way.
pub async fn run(
    buckets: &BucketManager,
    registry: &FetcherRegistry,
    repolist: &Repolist,
    only: Vec<String>,
) -> Result<()> {
    if let Some(unknown) = only
        .iter()
        .find(|id| !repolist.repositories().iter().any(|r| &r.id == *id))
    {
        anyhow::bail!("no repository with id `{unknown}` in the repolist");
    }

    let bucket = PullOrchestrator::new(buckets, registry)
        .pull_with(repolist.repositories(), &PullOptions { only })
        .await?;

    let failed = bucket.failed_repositories().count();
    println!(
        "Pulled {} records into bucket {} ({} repositories, {} failed).",
        bucket.record_count,
        bucket.id,
        bucket.repositories.len(),
        failed
    );
    format::print_repository_table(&bucket.repositories);

    Ok(())
}
