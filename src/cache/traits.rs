//! Core traits and types for the cache catalog.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::fetch::{Request, Response};

/// A stored request/response pair.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Normalized absolute URL of the request
  pub request_key: String,
  /// Snapshot of the response, `source` set to `Cache`
  pub response: Response,
  /// When the snapshot was written
  pub captured_at: DateTime<Utc>,
}

/// Trait for cache catalog backends.
///
/// A catalog is a set of named partitions, each mapping request keys to
/// response snapshots. Every write is atomic: a reader sees either the old or
/// the new snapshot, never a partial one.
pub trait CacheCatalog: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn open(&self, partition: &str) -> Result<()>;

  /// Store a response, replacing any previous entry for the same request.
  /// Opens the partition implicitly.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store several responses in a single transaction.
  fn put_all(&self, partition: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Look a request up in one partition.
  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedEntry>>;

  /// Look a request up across all partitions, oldest partition first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedEntry>>;

  /// Names of all partitions present, in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Drop a partition and everything in it. Returns whether it existed.
  fn delete(&self, partition: &str) -> Result<bool>;

  /// All entries of one partition.
  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>>;
}
