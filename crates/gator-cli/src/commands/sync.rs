use anyhow::Result;
use gator::{BucketRef, SyncEngine, SyncError, SyncOptions};

use super::format;

/// Sync a bucket into the canonical store and print the report.
///
/// Per-key failures are printed but only a missing bucket or an unreachable
/// store fails the command.
pub async fn run(engine: &SyncEngine<'_>, target: &BucketRef, options: &SyncOptions) -> Result<()> {
    match engine.sync(target, options).await {
        Ok(report) => {
            format::print_sync_report(&report);
            Ok(())
        }
        Err(SyncError::StoreUnavailable { reason, partial }) => {
            format::print_sync_report(&partial);
            anyhow::bail!("canonical store unavailable, sync aborted: {reason}")
        }
        Err(e) => Err(e.into()),
    }
}
