use std::time::Duration;

use gator::{RepositoryDescriptor, ResolveError};

/// Request timeout used when a descriptor does not set `timeout_secs`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("gator/", env!("CARGO_PKG_VERSION"));

/// The request timeout configured for a descriptor.
pub fn timeout(descriptor: &RepositoryDescriptor) -> Result<Duration, ResolveError> {
    match descriptor.param_u64("timeout_secs")? {
        None => Ok(DEFAULT_TIMEOUT),
        Some(0) => Err(ResolveError::invalid_params(
            descriptor,
            "`timeout_secs` must be greater than zero",
        )),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// An HTTP client with the descriptor's timeout applied.
pub fn http_client(descriptor: &RepositoryDescriptor) -> Result<reqwest::Client, ResolveError> {
    reqwest::Client::builder()
        .timeout(timeout(descriptor)?)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ResolveError::invalid_params(descriptor, format!("http client: {e}")))
}
