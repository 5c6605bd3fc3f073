use gator::{DatasetFetcher, FetchError, FetcherResult, Payload, Record, RepositoryDescriptor};
use tracing::debug;

use crate::client;
use crate::extract::Extraction;

pub const DATASET_TYPE: &str = "http-json";

/// Reads records from a JSON document served over HTTP GET.
pub struct HttpJsonFetcher {
    url: String,
    extraction: Extraction,
    client: reqwest::Client,
}

impl HttpJsonFetcher {
    pub fn new(url: impl Into<String>, extraction: Extraction, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            extraction,
            client,
        }
    }
}

#[async_trait::async_trait]
impl DatasetFetcher for HttpJsonFetcher {
    fn label(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Network(format!(
                "{} returned HTTP {status}",
                self.url
            )));
        }

        let document: Payload = response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let records = self.extraction.records(&document)?;
        debug!(url = %self.url, records = records.len(), "fetched json document");
        Ok(records)
    }
}

pub fn build(descriptor: &RepositoryDescriptor) -> FetcherResult {
    let extraction = Extraction::from_descriptor(descriptor)?;
    let client = client::http_client(descriptor)?;
    Ok(Box::new(HttpJsonFetcher::new(
        descriptor.source.clone(),
        extraction,
        client,
    )))
}
