//! Cache catalog: named, versioned partitions of request/response snapshots.
//!
//! This module provides:
//! - `CacheGeneration`, tying partition names to the application version
//! - `CacheCatalog`, the storage contract used by the strategy engine and the
//!   lifecycle manager
//! - `SqliteCatalog`, the on-disk implementation

mod generation;
mod storage;
mod traits;

pub use generation::{CacheGeneration, PartitionKind};
pub use storage::SqliteCatalog;
pub use traits::{CacheCatalog, CachedEntry};
