pub mod canonical;
pub mod disk;
mod schema;

pub use canonical::{SqliteCanonicalStore, StoreError, StoredDocument};
pub use disk::DiskStorage;
