use anyhow::Result;
use gator::{FetcherRegistry, Repolist};

/// Validate that every enabled repository resolves to a fetcher.
pub fn run(repolist: &Repolist, registry: &FetcherRegistry) -> Result<()> {
    let unresolved = repolist.unresolved(registry);

    for descriptor in repolist.repositories() {
        let status = if !descriptor.enabled {
            "disabled".to_owned()
        } else if let Some((_, error)) = unresolved.iter().find(|(id, _)| id == &descriptor.id) {
            format!("error: {error}")
        } else {
            "ok".to_owned()
        };
        println!("{:<40}  {:<12}  {}", descriptor.id, descriptor.dataset_type, status);
    }

    if !unresolved.is_empty() {
        anyhow::bail!(
            "{} of {} repositories cannot be resolved",
            unresolved.len(),
            repolist.len()
        );
    }

    println!("{} repositories OK", repolist.enabled().count());
    Ok(())
}
