pub mod client;
pub mod extract;
pub mod http_json;
pub mod json_file;
pub mod timetable;

use gator::FetcherRegistry;

pub use extract::Extraction;
pub use http_json::HttpJsonFetcher;
pub use json_file::JsonFileFetcher;
pub use timetable::{TimetableConfig, TimetableFetcher};

/// Register every dataset type this crate provides.
pub fn register_builtin(registry: &mut FetcherRegistry) -> &mut FetcherRegistry {
    registry
        .register(timetable::DATASET_TYPE, timetable::build)
        .register(http_json::DATASET_TYPE, http_json::build)
        .register(json_file::DATASET_TYPE, json_file::build)
}

/// A registry with every built-in dataset type.
pub fn builtin_registry() -> FetcherRegistry {
    let mut registry = FetcherRegistry::new();
    register_builtin(&mut registry);
    registry
}
