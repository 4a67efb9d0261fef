//! The pending-write queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use super::stories::{select_story, upsert_story};
use super::{storage_err, Database, StoryRecord};
use crate::error::{Result, SyncError};
use crate::remote::{NewStory, Story};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingKind {
  Create,
  Delete,
}

impl PendingKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Delete => "delete",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "create" => Ok(Self::Create),
      "delete" => Ok(Self::Delete),
      other => Err(SyncError::StorageFailure(format!("Unknown pending kind '{}'", other))),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
  Pending,
  Syncing,
  Synced,
  /// Retry ceiling reached; kept for the user to retry or discard
  Failed,
}

impl PendingStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Synced => "synced",
      Self::Failed => "failed",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "syncing" => Ok(Self::Syncing),
      "synced" => Ok(Self::Synced),
      "failed" => Ok(Self::Failed),
      other => Err(SyncError::StorageFailure(format!("Unknown pending status '{}'", other))),
    }
  }
}

impl fmt::Display for PendingStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A user action the remote authority has not confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
  /// Auto-assigned, monotonic
  pub local_id: i64,
  pub kind: PendingKind,
  /// Story the action applies to (`offline-<local_id>` for local creates)
  pub story_id: String,
  /// `NewStory` for creates, `null` for deletes
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub status: PendingStatus,
  pub retry_count: u32,
  pub last_error: Option<String>,
}

impl PendingWrite {
  /// Decode the payload of a create.
  pub fn new_story(&self) -> Result<NewStory> {
    serde_json::from_value(self.payload.clone()).map_err(|e| {
      SyncError::StorageFailure(format!(
        "Pending write {} has an invalid payload: {}",
        self.local_id, e
      ))
    })
  }
}

/// Id given to a story created while offline.
pub fn offline_story_id(local_id: i64) -> String {
  format!("offline-{}", local_id)
}

const SELECT_COLUMNS: &str =
  "SELECT local_id, kind, story_id, payload, created_at, status, retry_count, last_error FROM pending_writes";

type PendingRow = (i64, String, String, String, String, String, u32, Option<String>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
  ))
}

fn row_to_write(row: PendingRow) -> Result<PendingWrite> {
  let (local_id, kind, story_id, payload, created_at, status, retry_count, last_error) = row;
  Ok(PendingWrite {
    local_id,
    kind: PendingKind::parse(&kind)?,
    story_id,
    payload: serde_json::from_str(&payload)
      .map_err(|e| SyncError::StorageFailure(format!("Corrupt pending payload: {}", e)))?,
    created_at: DateTime::parse_from_rfc3339(&created_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| SyncError::StorageFailure(format!("Failed to parse datetime '{}': {}", created_at, e)))?,
    status: PendingStatus::parse(&status)?,
    retry_count,
    last_error,
  })
}

fn select_writes(conn: &Connection, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<PendingWrite>> {
  let sql = format!("{} {} ORDER BY local_id", SELECT_COLUMNS, filter);
  let mut stmt = conn.prepare(&sql).map_err(storage_err("Failed to prepare query"))?;
  let rows = stmt
    .query_map(args, read_row)
    .map_err(storage_err("Failed to query pending writes"))?
    .collect::<std::result::Result<Vec<PendingRow>, _>>()
    .map_err(storage_err("Failed to read pending write"))?;
  rows.into_iter().map(row_to_write).collect()
}

fn select_write(conn: &Connection, local_id: i64) -> Result<Option<PendingWrite>> {
  let sql = format!("{} WHERE local_id = ?", SELECT_COLUMNS);
  let row = conn
    .query_row(&sql, params![local_id], read_row)
    .optional()
    .map_err(storage_err("Failed to read pending write"))?;
  row.map(row_to_write).transpose()
}

fn insert_write(
  conn: &Connection,
  kind: PendingKind,
  story_id: &str,
  payload: &serde_json::Value,
) -> Result<i64> {
  conn
    .execute(
      "INSERT INTO pending_writes (kind, story_id, payload, created_at, status, retry_count)
       VALUES (?, ?, ?, ?, ?, 0)",
      params![
        kind.as_str(),
        story_id,
        payload.to_string(),
        Utc::now().to_rfc3339(),
        PendingStatus::Pending.as_str()
      ],
    )
    .map_err(storage_err("Failed to record pending write"))?;
  Ok(conn.last_insert_rowid())
}

fn set_status(conn: &Connection, local_id: i64, status: PendingStatus) -> Result<usize> {
  conn
    .execute(
      "UPDATE pending_writes SET status = ? WHERE local_id = ?",
      params![status.as_str(), local_id],
    )
    .map_err(storage_err("Failed to update pending write"))
}

fn set_story_flags(conn: &Connection, story_id: &str, is_offline: bool, is_pending: bool) -> Result<()> {
  conn
    .execute(
      "UPDATE stories SET is_offline = ?, is_pending = ? WHERE id = ?",
      params![is_offline, is_pending, story_id],
    )
    .map_err(storage_err("Failed to update story flags"))?;
  Ok(())
}

fn queue_delete(conn: &Connection, story_id: &str, record: Option<&StoryRecord>) -> Result<Option<PendingWrite>> {
  let local_id = insert_write(conn, PendingKind::Delete, story_id, &serde_json::Value::Null)?;
  if let Some(record) = record {
    set_story_flags(conn, story_id, record.is_offline, true)?;
  }
  select_write(conn, local_id)
}

fn missing(local_id: i64) -> SyncError {
  SyncError::StorageFailure(format!("Pending write {} not found", local_id))
}

impl Database {
  /// Queue a story created while offline, together with its shadow record.
  ///
  /// Both rows are written in one transaction: either the action is durable
  /// or the caller gets an error.
  pub fn enqueue_create(&self, story: &NewStory, author: &str) -> Result<(PendingWrite, StoryRecord)> {
    let payload = serde_json::to_value(story)
      .map_err(|e| SyncError::StorageFailure(format!("Failed to serialize story: {}", e)))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(storage_err("Failed to begin transaction"))?;

    let local_id = insert_write(&tx, PendingKind::Create, "", &payload)?;
    let story_id = offline_story_id(local_id);
    tx.execute(
      "UPDATE pending_writes SET story_id = ? WHERE local_id = ?",
      params![story_id, local_id],
    )
    .map_err(storage_err("Failed to update pending write"))?;

    let record = StoryRecord {
      story: Story {
        id: story_id,
        name: author.to_string(),
        description: story.description.clone(),
        photo_url: story.photo.clone(),
        created_at: Some(Utc::now().to_rfc3339()),
        lat: story.lat,
        lon: story.lon,
      },
      is_offline: true,
      is_pending: true,
    };
    upsert_story(&tx, &record)?;

    let write = select_write(&tx, local_id)?.ok_or_else(|| missing(local_id))?;
    tx.commit().map_err(storage_err("Failed to commit transaction"))?;
    Ok((write, record))
  }

  /// Queue an action on an already cached story.
  ///
  /// Returns `None` when nothing needs to reach the remote authority: a
  /// delete of a story that only exists offline cancels its pending create.
  /// Queueing the same action twice returns the existing entry.
  pub fn mark_pending(&self, story_id: &str, kind: PendingKind) -> Result<Option<PendingWrite>> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(storage_err("Failed to begin transaction"))?;

    let existing = select_writes(
      &tx,
      "WHERE story_id = ? AND kind = ? AND status IN ('pending', 'syncing', 'failed')",
      &[&story_id, &kind.as_str()],
    )?;
    if let Some(write) = existing.into_iter().next() {
      return Ok(Some(write));
    }

    let record = select_story(&tx, story_id)?;
    let result = match kind {
      PendingKind::Delete if record.as_ref().is_some_and(|r| r.is_offline) => {
        // A create already on its way to the remote authority cannot be
        // recalled; the delete follows it once the remote id is known.
        let in_flight = select_writes(
          &tx,
          "WHERE story_id = ? AND kind = 'create' AND status = 'syncing'",
          &[&story_id],
        )?;
        if in_flight.is_empty() {
          tx.execute("DELETE FROM pending_writes WHERE story_id = ?", params![story_id])
            .map_err(storage_err("Failed to cancel pending create"))?;
          tx.execute("DELETE FROM stories WHERE id = ?", params![story_id])
            .map_err(storage_err("Failed to delete story"))?;
          None
        } else {
          queue_delete(&tx, story_id, record.as_ref())?
        }
      }
      PendingKind::Delete => queue_delete(&tx, story_id, record.as_ref())?,
      PendingKind::Create => {
        let record = record.ok_or_else(|| {
          SyncError::StorageFailure(format!("Story {} is not cached", story_id))
        })?;
        let payload = serde_json::to_value(NewStory {
          description: record.story.description.clone(),
          photo: record.story.photo_url.clone(),
          lat: record.story.lat,
          lon: record.story.lon,
        })
        .map_err(|e| SyncError::StorageFailure(format!("Failed to serialize story: {}", e)))?;
        let local_id = insert_write(&tx, kind, story_id, &payload)?;
        set_story_flags(&tx, story_id, true, true)?;
        select_write(&tx, local_id)?
      }
    };

    tx.commit().map_err(storage_err("Failed to commit transaction"))?;
    Ok(result)
  }

  pub fn get_pending(&self, local_id: i64) -> Result<Option<PendingWrite>> {
    let conn = self.lock()?;
    select_write(&conn, local_id)
  }

  /// Writes awaiting replay, oldest first.
  pub fn pending_writes(&self) -> Result<Vec<PendingWrite>> {
    let conn = self.lock()?;
    select_writes(&conn, "WHERE status = ?", &[&PendingStatus::Pending.as_str()])
  }

  /// Writes that reached the retry ceiling.
  pub fn failed_writes(&self) -> Result<Vec<PendingWrite>> {
    let conn = self.lock()?;
    select_writes(&conn, "WHERE status = ?", &[&PendingStatus::Failed.as_str()])
  }

  /// Every queued write regardless of status.
  pub fn all_writes(&self) -> Result<Vec<PendingWrite>> {
    let conn = self.lock()?;
    select_writes(&conn, "", &[])
  }

  pub fn mark_syncing(&self, local_id: i64) -> Result<()> {
    let conn = self.lock()?;
    if set_status(&conn, local_id, PendingStatus::Syncing)? == 0 {
      return Err(missing(local_id));
    }
    Ok(())
  }

  /// Apply a confirmed remote acceptance: the write becomes Synced and is
  /// removed, and its shadow story is settled.
  ///
  /// For creates, `created` replaces the shadow record when the remote
  /// authority echoed the new story; otherwise the shadow's flags are
  /// cleared. A delete queued while the create was in flight is retargeted
  /// at the created story. For deletes the story is removed.
  ///
  /// A write discarded while in flight stays cancelled: a created story is
  /// not stored locally and a delete for it is queued instead.
  pub fn complete(&self, write: &PendingWrite, created: Option<&Story>) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(storage_err("Failed to begin transaction"))?;

    let cancelled = set_status(&tx, write.local_id, PendingStatus::Synced)? == 0;
    tx.execute(
      "DELETE FROM pending_writes WHERE local_id = ?",
      params![write.local_id],
    )
    .map_err(storage_err("Failed to delete pending write"))?;

    let follow_up = if write.kind == PendingKind::Create {
      select_writes(
        &tx,
        "WHERE story_id = ? AND kind = 'delete'",
        &[&write.story_id],
      )?
    } else {
      Vec::new()
    };

    match (write.kind, created) {
      (PendingKind::Create, Some(story)) if cancelled => {
        warn!(local_id = write.local_id, story_id = %story.id, "Create landed after it was discarded, queueing a delete");
        queue_delete(&tx, &story.id, None)?;
      }
      (PendingKind::Create, None) if cancelled => {
        warn!(local_id = write.local_id, "Create landed after it was discarded; remote id unknown");
      }
      (PendingKind::Create, Some(story)) => {
        tx.execute("DELETE FROM stories WHERE id = ?", params![write.story_id])
          .map_err(storage_err("Failed to delete shadow story"))?;
        let mut record = StoryRecord::remote(story.clone());
        record.is_pending = !follow_up.is_empty();
        upsert_story(&tx, &record)?;
        tx.execute(
          "UPDATE pending_writes SET story_id = ? WHERE story_id = ? AND kind = 'delete'",
          params![story.id, write.story_id],
        )
        .map_err(storage_err("Failed to retarget pending delete"))?;
      }
      (PendingKind::Create, None) if !follow_up.is_empty() => {
        // Without the remote id the queued delete has nothing to target
        warn!(local_id = write.local_id, "Created story has no remote id, dropping its queued delete");
        tx.execute(
          "DELETE FROM pending_writes WHERE story_id = ? AND kind = 'delete'",
          params![write.story_id],
        )
        .map_err(storage_err("Failed to drop pending delete"))?;
        tx.execute("DELETE FROM stories WHERE id = ?", params![write.story_id])
          .map_err(storage_err("Failed to delete shadow story"))?;
      }
      (PendingKind::Create, None) => {
        set_story_flags(&tx, &write.story_id, false, false)?;
      }
      (PendingKind::Delete, _) => {
        tx.execute("DELETE FROM stories WHERE id = ?", params![write.story_id])
          .map_err(storage_err("Failed to delete story"))?;
      }
    }

    tx.commit().map_err(storage_err("Failed to commit transaction"))?;
    Ok(())
  }

  /// Record a failed replay. Returns the resulting status: `Failed` once
  /// the retry count reaches `ceiling`, `Pending` otherwise.
  pub fn record_failure(&self, local_id: i64, error: &str, ceiling: u32) -> Result<PendingStatus> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(storage_err("Failed to begin transaction"))?;

    let write = select_write(&tx, local_id)?.ok_or_else(|| missing(local_id))?;
    let retry_count = write.retry_count + 1;
    let status = if retry_count >= ceiling {
      PendingStatus::Failed
    } else {
      PendingStatus::Pending
    };

    tx.execute(
      "UPDATE pending_writes SET status = ?, retry_count = ?, last_error = ? WHERE local_id = ?",
      params![status.as_str(), retry_count, error, local_id],
    )
    .map_err(storage_err("Failed to update pending write"))?;

    tx.commit().map_err(storage_err("Failed to commit transaction"))?;
    Ok(status)
  }

  /// Give a permanently failed write another round of attempts.
  pub fn retry(&self, local_id: i64) -> Result<bool> {
    let conn = self.lock()?;
    let updated = conn
      .execute(
        "UPDATE pending_writes SET status = 'pending', retry_count = 0, last_error = NULL
         WHERE local_id = ? AND status = 'failed'",
        params![local_id],
      )
      .map_err(storage_err("Failed to update pending write"))?;
    Ok(updated > 0)
  }

  /// Drop a queued write and undo its local effect.
  pub fn discard(&self, local_id: i64) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(storage_err("Failed to begin transaction"))?;

    let Some(write) = select_write(&tx, local_id)? else {
      return Ok(false);
    };

    tx.execute("DELETE FROM pending_writes WHERE local_id = ?", params![local_id])
      .map_err(storage_err("Failed to delete pending write"))?;
    match write.kind {
      PendingKind::Create => {
        tx.execute("DELETE FROM stories WHERE id = ? AND is_offline = 1", params![write.story_id])
          .map_err(storage_err("Failed to delete shadow story"))?;
      }
      PendingKind::Delete => {
        tx.execute(
          "UPDATE stories SET is_pending = 0 WHERE id = ?",
          params![write.story_id],
        )
        .map_err(storage_err("Failed to update story flags"))?;
      }
    }

    tx.commit().map_err(storage_err("Failed to commit transaction"))?;
    Ok(true)
  }

  /// Put writes left in Syncing by an interrupted pass back in the queue.
  pub(super) fn reset_interrupted(&self) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE pending_writes SET status = 'pending' WHERE status = 'syncing'",
        [],
      )
      .map_err(storage_err("Failed to reset interrupted writes"))
  }
}
