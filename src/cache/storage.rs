//! SQLite implementation of the cache catalog.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{CacheCatalog, CachedEntry};
use crate::error::{Result, SyncError};
use crate::fetch::{Request, Response, ResponseSource};

/// SQLite-based cache catalog.
pub struct SqliteCatalog {
  conn: Mutex<Connection>,
}

impl SqliteCatalog {
  /// Open (or create) the catalog at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::CacheFailure(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::CacheFailure(format!(
        "Failed to open cache catalog at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Catalog that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to open in-memory catalog: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CATALOG_SCHEMA)
      .map_err(|e| SyncError::CacheFailure(format!("Failed to run catalog migrations: {}", e)))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::CacheFailure(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for the catalog tables.
const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- One response snapshot per (partition, request)
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    entry_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at TEXT NOT NULL,
    PRIMARY KEY (partition, entry_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_hash ON entries(entry_hash);
"#;

/// SHA256 of method + key for stable, fixed-length lookups.
fn entry_hash(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(request.cache_key().as_bytes());
  hex::encode(hasher.finalize())
}

fn ensure_partition(conn: &Connection, partition: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
      params![partition, Utc::now().to_rfc3339()],
    )
    .map_err(|e| SyncError::CacheFailure(format!("Failed to open partition {}: {}", partition, e)))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  partition: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| SyncError::CacheFailure(format!("Failed to serialize headers: {}", e)))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (partition, entry_hash, request_key, status, headers, body, captured_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        entry_hash(request),
        request.cache_key(),
        response.status,
        headers,
        response.body,
        Utc::now().to_rfc3339(),
      ],
    )
    .map_err(|e| SyncError::CacheFailure(format!("Failed to store entry in {}: {}", partition, e)))?;
  Ok(())
}

type EntryRow = (String, u16, String, Vec<u8>, String);

fn row_to_entry(row: EntryRow) -> Result<CachedEntry> {
  let (request_key, status, headers, body, captured_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| SyncError::CacheFailure(format!("Corrupt headers for {}: {}", request_key, e)))?;

  Ok(CachedEntry {
    request_key,
    response: Response {
      status,
      headers,
      body,
      source: ResponseSource::Cache,
    },
    captured_at: parse_datetime(&captured_at)?,
  })
}

impl CacheCatalog for SqliteCatalog {
  fn open(&self, partition: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_partition(&conn, partition)
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    self.put_all(partition, &[(request.clone(), response.clone())])
  }

  fn put_all(&self, partition: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to begin transaction: {}", e)))?;

    ensure_partition(&tx, partition)?;
    for (request, response) in entries {
      insert_entry(&tx, partition, request, response)?;
    }

    tx.commit()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to commit transaction: {}", e)))?;
    Ok(())
  }

  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT request_key, status, headers, body, captured_at FROM entries
         WHERE partition = ? AND entry_hash = ?",
        params![partition, entry_hash(request)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to query {}: {}", partition, e)))?;

    row.map(row_to_entry).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.request_key, e.status, e.headers, e.body, e.captured_at FROM entries e
         INNER JOIN partitions p ON p.name = e.partition
         WHERE e.entry_hash = ?
         ORDER BY p.rowid
         LIMIT 1",
        params![entry_hash(request)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to query catalog: {}", e)))?;

    row.map(row_to_entry).transpose()
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY rowid")
      .map_err(|e| SyncError::CacheFailure(format!("Failed to prepare query: {}", e)))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| SyncError::CacheFailure(format!("Failed to list partitions: {}", e)))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to read partition name: {}", e)))?;

    Ok(names)
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to begin transaction: {}", e)))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![partition])
      .map_err(|e| SyncError::CacheFailure(format!("Failed to clear {}: {}", partition, e)))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| SyncError::CacheFailure(format!("Failed to delete {}: {}", partition, e)))?;

    tx.commit()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to commit transaction: {}", e)))?;
    Ok(removed > 0)
  }

  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT request_key, status, headers, body, captured_at FROM entries
         WHERE partition = ? ORDER BY request_key",
      )
      .map_err(|e| SyncError::CacheFailure(format!("Failed to prepare query: {}", e)))?;

    let rows = stmt
      .query_map(params![partition], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .map_err(|e| SyncError::CacheFailure(format!("Failed to query {}: {}", partition, e)))?
      .collect::<std::result::Result<Vec<EntryRow>, _>>()
      .map_err(|e| SyncError::CacheFailure(format!("Failed to read entry: {}", e)))?;

    rows.into_iter().map(row_to_entry).collect()
  }
}

/// Parse an RFC 3339 timestamp written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| SyncError::CacheFailure(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(url: &str) -> Request {
    Request::get(url).unwrap()
  }

  #[test]
  fn test_put_then_match() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let req = request("https://stories.example/styles.css");
    catalog
      .put("runtime", &req, &Response::new(200, "body{}"))
      .unwrap();

    let entry = catalog.match_in("runtime", &req).unwrap().unwrap();
    assert_eq!(entry.request_key, "https://stories.example/styles.css");
    assert_eq!(entry.response.body, b"body{}");
    assert_eq!(entry.response.source, ResponseSource::Cache);
    assert!(catalog.match_in("api", &req).unwrap().is_none());
  }

  #[test]
  fn test_put_overwrites() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let req = request("https://stories.example/a.js");
    catalog.put("runtime", &req, &Response::new(200, "v1")).unwrap();
    catalog.put("runtime", &req, &Response::new(200, "v2")).unwrap();

    let entries = catalog.entries("runtime").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response.text(), "v2");
  }

  #[test]
  fn test_match_any_prefers_oldest_partition() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let req = request("https://stories.example/index.html");
    catalog.open("core").unwrap();
    catalog.open("runtime").unwrap();
    catalog.put("runtime", &req, &Response::new(200, "runtime")).unwrap();
    catalog.put("core", &req, &Response::new(200, "core")).unwrap();

    let entry = catalog.match_any(&req).unwrap().unwrap();
    assert_eq!(entry.response.text(), "core");
  }

  #[test]
  fn test_delete_partition() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let req = request("https://stories.example/");
    catalog.put("home", &req, &Response::new(200, "<html>")).unwrap();

    assert!(catalog.delete("home").unwrap());
    assert!(!catalog.delete("home").unwrap());
    assert!(catalog.keys().unwrap().is_empty());
    assert!(catalog.match_any(&req).unwrap().is_none());
  }

  #[test]
  fn test_headers_round_trip() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let req = request("https://stories.example/api/stories");
    let response = Response::new(200, "[]").with_header("content-type", "application/json");
    catalog.put("api", &req, &response).unwrap();

    let entry = catalog.match_in("api", &req).unwrap().unwrap();
    assert_eq!(entry.response.header("Content-Type"), Some("application/json"));
  }
}
