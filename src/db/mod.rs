//! Durable store for cached stories and the pending-write queue.
//!
//! Backed by SQLite, versioned with `PRAGMA user_version`. A single
//! connection behind a mutex serializes every operation, so concurrent
//! writes to the same record cannot lose updates.

mod pending;
pub mod schema;
mod stories;

pub use pending::{PendingKind, PendingStatus, PendingWrite};
pub use stories::StoryRecord;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// Database connection wrapper for the durable store
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the store at the given path
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageFailure(format!("Failed to create database directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageFailure(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Store that lives only as long as the process
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::StorageFailure(format!("Failed to open in-memory database: {}", e)))?;
    Self::from_connection(conn)
  }

  pub(crate) fn from_connection(mut conn: Connection) -> Result<Self> {
    Self::run_migrations(&mut conn)?;
    let db = Self {
      conn: Mutex::new(conn),
    };

    // A pass interrupted by a restart leaves records in Syncing
    let recovered = db.reset_interrupted()?;
    if recovered > 0 {
      info!(count = recovered, "Recovered pending writes from an interrupted sync");
    }

    Ok(db)
  }

  /// Apply every migration newer than the stored schema version
  fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| SyncError::StorageFailure(format!("Failed to read schema version: {}", e)))?;
    let current = current.max(0) as usize;

    for (index, migration) in schema::MIGRATIONS.iter().enumerate() {
      let version = index + 1;
      if version <= current {
        continue;
      }

      let tx = conn
        .transaction()
        .map_err(|e| SyncError::StorageFailure(format!("Failed to begin migration: {}", e)))?;
      tx.execute_batch(migration).map_err(|e| {
        SyncError::StorageFailure(format!("Failed to run migration {}: {}", version, e))
      })?;
      tx.execute_batch(&format!("PRAGMA user_version = {}", version))
        .map_err(|e| SyncError::StorageFailure(format!("Failed to set schema version: {}", e)))?;
      tx.commit()
        .map_err(|e| SyncError::StorageFailure(format!("Failed to commit migration: {}", e)))?;

      debug!(version, "Applied durable store migration");
    }

    Ok(())
  }

  /// Current schema version
  pub fn schema_version(&self) -> Result<usize> {
    let conn = self.lock()?;
    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| SyncError::StorageFailure(format!("Failed to read schema version: {}", e)))?;
    Ok(version.max(0) as usize)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageFailure(format!("Lock poisoned: {}", e)))
  }
}

/// Map a rusqlite error into the store's error type with context.
fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> SyncError + '_ {
  move |e| SyncError::StorageFailure(format!("{}: {}", context, e))
}
