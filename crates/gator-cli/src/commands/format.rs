use gator::{Bucket, RepositoryOutcome, RepositoryReport, SyncReport};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const MAX_REPO_WIDTH: usize = 40;
const LINE_BUDGET: usize = 100;

/// Render epoch milliseconds as an RFC 3339 UTC timestamp.
pub fn timestamp(millis: u64) -> String {
    i128::from(millis)
        .checked_mul(1_000_000)
        .and_then(|nanos| OffsetDateTime::from_unix_timestamp_nanos(nanos).ok())
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| millis.to_string())
}

pub fn print_repository_table(reports: &[RepositoryReport]) {
    if reports.is_empty() {
        println!("  (no repositories)");
        return;
    }

    let repo_width = reports
        .iter()
        .map(|r| r.repository.chars().count())
        .max()
        .unwrap_or(0)
        .min(MAX_REPO_WIDTH);
    let detail_budget = LINE_BUDGET.saturating_sub(2 + repo_width + 2 + 6 + 2);

    for report in reports {
        let repository = truncate(&report.repository, repo_width);
        let (status, detail) = match &report.outcome {
            RepositoryOutcome::Succeeded { records } => ("ok", format!("{records} records")),
            RepositoryOutcome::Failed {
                error,
                records_written,
            } => (
                "FAILED",
                format!("{error} ({records_written} records written)"),
            ),
        };

        println!(
            "  {:<width$}  {:<6}  {}",
            repository,
            status,
            truncate(&detail, detail_budget),
            width = repo_width
        );
        for warning in &report.warnings {
            println!("  {:<width$}  {:<6}  {}", "", "warn", warning, width = repo_width);
        }
    }
}

pub fn print_bucket(bucket: &Bucket) {
    println!("Bucket:   {}", bucket.id);
    println!("Created:  {}", timestamp(bucket.created_at));
    println!("Sealed:   {}", timestamp(bucket.sealed_at));
    println!("Records:  {}", bucket.record_count);
    println!("Repositories:");
    print_repository_table(&bucket.repositories);
}

pub fn print_sync_report(report: &SyncReport) {
    println!(
        "Synced bucket {}: {} inserted, {} updated, {} skipped, {} failed.",
        report.bucket_id,
        report.inserted,
        report.updated,
        report.skipped,
        report.failed()
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.key, failure.reason);
    }
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_owned()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate("repoA", 10), "repoA");
    }

    #[test]
    fn truncate_long_string_adds_ellipsis() {
        assert_eq!(truncate("timetable:repoA", 6), "timet…");
    }

    #[test]
    fn timestamp_is_rfc3339_utc() {
        assert_eq!(timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(timestamp(1_700_000_000_123), "2023-11-14T22:13:20.123Z");
    }
}
