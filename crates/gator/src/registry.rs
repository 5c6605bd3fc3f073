use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fetcher::DatasetFetcher;
use crate::repolist::RepositoryDescriptor;

/// Why a descriptor could not be turned into a fetcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown dataset type: {0}")]
    UnknownDatasetType(String),

    #[error("invalid params for repository {repository}: {reason}")]
    InvalidParams { repository: String, reason: String },
}

impl ResolveError {
    pub fn invalid_params(descriptor: &RepositoryDescriptor, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            repository: descriptor.id.clone(),
            reason: reason.into(),
        }
    }
}

/// Result of building a fetcher from a descriptor.
pub type FetcherResult = Result<Box<dyn DatasetFetcher>, ResolveError>;

/// Builds a fetcher for descriptors of one dataset type.
pub trait FetcherFactory: Send + Sync {
    fn build(&self, descriptor: &RepositoryDescriptor) -> FetcherResult;
}

impl<F> FetcherFactory for F
where
    F: Fn(&RepositoryDescriptor) -> FetcherResult + Send + Sync,
{
    fn build(&self, descriptor: &RepositoryDescriptor) -> FetcherResult {
        self(descriptor)
    }
}

/// Explicit mapping from dataset type tag to fetcher factory.
#[derive(Default, Clone)]
pub struct FetcherRegistry {
    factories: BTreeMap<String, Arc<dyn FetcherFactory>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor function for a type tag, replacing any
    /// earlier registration.
    pub fn register<F>(&mut self, dataset_type: impl Into<String>, build: F) -> &mut Self
    where
        F: Fn(&RepositoryDescriptor) -> FetcherResult + Send + Sync + 'static,
    {
        self.register_factory(dataset_type, build)
    }

    /// Register a factory object for a type tag.
    pub fn register_factory(
        &mut self,
        dataset_type: impl Into<String>,
        factory: impl FetcherFactory + 'static,
    ) -> &mut Self {
        self.factories
            .insert(dataset_type.into(), Arc::new(factory));
        self
    }

    /// Registered type tags, sorted.
    pub fn dataset_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn resolve(&self, descriptor: &RepositoryDescriptor) -> FetcherResult {
        let factory = self
            .factories
            .get(&descriptor.dataset_type)
            .ok_or_else(|| ResolveError::UnknownDatasetType(descriptor.dataset_type.clone()))?;
        factory.build(descriptor)
    }
}
