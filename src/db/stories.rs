use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{storage_err, Database};
use crate::error::{Result, SyncError};
use crate::remote::Story;

/// A story as cached on this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRecord {
  #[serde(flatten)]
  pub story: Story,
  /// Originated locally, not yet confirmed by the remote authority
  #[serde(default)]
  pub is_offline: bool,
  /// Queued for create/delete
  #[serde(default)]
  pub is_pending: bool,
}

impl StoryRecord {
  /// Record for a story confirmed by the remote authority.
  pub fn remote(story: Story) -> Self {
    Self {
      story,
      is_offline: false,
      is_pending: false,
    }
  }

  pub fn id(&self) -> &str {
    &self.story.id
  }
}

type StoryRow = (String, bool, bool);

fn row_to_record(row: StoryRow) -> Result<StoryRecord> {
  let (data, is_offline, is_pending) = row;
  let story: Story = serde_json::from_str(&data)
    .map_err(|e| SyncError::StorageFailure(format!("Corrupt story record: {}", e)))?;
  Ok(StoryRecord {
    story,
    is_offline,
    is_pending,
  })
}

pub(super) fn upsert_story(conn: &Connection, record: &StoryRecord) -> Result<()> {
  let data = serde_json::to_string(&record.story)
    .map_err(|e| SyncError::StorageFailure(format!("Failed to serialize story: {}", e)))?;

  conn
    .execute(
      "INSERT INTO stories (id, data, is_offline, is_pending, stored_at)
       VALUES (?1, ?2, ?3, ?4, ?5)
       ON CONFLICT(id) DO UPDATE SET
         data = excluded.data,
         is_offline = excluded.is_offline,
         is_pending = excluded.is_pending,
         stored_at = excluded.stored_at",
      params![
        record.story.id,
        data,
        record.is_offline,
        record.is_pending,
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(storage_err("Failed to store story"))?;
  Ok(())
}

pub(super) fn select_story(conn: &Connection, id: &str) -> Result<Option<StoryRecord>> {
  let row: Option<StoryRow> = conn
    .query_row(
      "SELECT data, is_offline, is_pending FROM stories WHERE id = ?",
      params![id],
      |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .optional()
    .map_err(storage_err("Failed to read story"))?;

  row.map(row_to_record).transpose()
}

impl Database {
  /// Store a story, replacing any previous record with the same id.
  pub fn put(&self, record: &StoryRecord) -> Result<()> {
    let conn = self.lock()?;
    upsert_story(&conn, record)
  }

  pub fn get(&self, id: &str) -> Result<Option<StoryRecord>> {
    let conn = self.lock()?;
    select_story(&conn, id)
  }

  /// All cached stories in the order they were first stored.
  pub fn get_all(&self) -> Result<Vec<StoryRecord>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT data, is_offline, is_pending FROM stories ORDER BY seq")
      .map_err(storage_err("Failed to prepare query"))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(storage_err("Failed to query stories"))?
      .collect::<std::result::Result<Vec<StoryRow>, _>>()
      .map_err(storage_err("Failed to read story"))?;

    rows.into_iter().map(row_to_record).collect()
  }

  /// Remove a story. Absent ids are not an error; returns whether a row
  /// was removed.
  pub fn delete(&self, id: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM stories WHERE id = ?", params![id])
      .map_err(storage_err("Failed to delete story"))?;
    Ok(removed > 0)
  }

  /// Replace the cached snapshot with a freshly fetched list.
  ///
  /// Records without pending writes are dropped first (last fetch wins).
  /// Records with pending writes keep their flags, so every pending story
  /// still has its queue entry.
  pub fn replace_all(&self, stories: &[Story]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(storage_err("Failed to begin transaction"))?;

    tx.execute("DELETE FROM stories WHERE is_pending = 0", [])
      .map_err(storage_err("Failed to clear stories"))?;

    for story in stories {
      let existing = select_story(&tx, &story.id)?;
      let record = match existing {
        Some(previous) => StoryRecord {
          story: story.clone(),
          is_offline: previous.is_offline,
          is_pending: previous.is_pending,
        },
        None => StoryRecord::remote(story.clone()),
      };
      upsert_story(&tx, &record)?;
    }

    tx.commit().map_err(storage_err("Failed to commit transaction"))?;
    Ok(())
  }
}
