use std::path::PathBuf;

use gator::{DatasetFetcher, FetchError, FetcherResult, Payload, Record, RepositoryDescriptor};

use crate::extract::Extraction;

pub const DATASET_TYPE: &str = "json-file";

/// Reads records from a JSON document on the local filesystem.
pub struct JsonFileFetcher {
    path: PathBuf,
    label: String,
    extraction: Extraction,
}

impl JsonFileFetcher {
    pub fn new(path: impl Into<PathBuf>, extraction: Extraction) -> Self {
        let path = path.into();
        Self {
            label: path.display().to_string(),
            path,
            extraction,
        }
    }
}

#[async_trait::async_trait]
impl DatasetFetcher for JsonFileFetcher {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FetchError::Io(format!("{}: {e}", self.label)))?;
        let document: Payload = serde_json::from_str(&contents)
            .map_err(|e| FetchError::Parse(format!("{}: {e}", self.label)))?;

        self.extraction.records(&document)
    }
}

pub fn build(descriptor: &RepositoryDescriptor) -> FetcherResult {
    let extraction = Extraction::from_descriptor(descriptor)?;
    Ok(Box::new(JsonFileFetcher::new(&descriptor.source, extraction)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn fetch_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courses.json");
        std::fs::write(
            &path,
            json!([{"id": "CSC108", "title": "Intro"}, {"id": "CSC148"}]).to_string(),
        )
        .unwrap();

        let descriptor = RepositoryDescriptor::new(DATASET_TYPE, path.display().to_string());
        let records = build(&descriptor).unwrap().fetch().await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload()["title"], "Intro");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = RepositoryDescriptor::new(
            DATASET_TYPE,
            dir.path().join("absent.json").display().to_string(),
        );

        let result = build(&descriptor).unwrap().fetch().await;
        assert!(matches!(result, Err(FetchError::Io(_))));
    }
}
