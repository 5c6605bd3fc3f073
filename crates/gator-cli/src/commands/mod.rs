pub mod buckets;
pub mod check;
pub mod format;
pub mod prune;
pub mod pull;
pub mod records;
pub mod sync;
