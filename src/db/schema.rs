//! Durable store migrations, applied in order. Index + 1 is the schema
//! version recorded in `PRAGMA user_version`.

/// Cached stories, one row per story id.
const V1_STORIES: &str = r#"
CREATE TABLE IF NOT EXISTS stories (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    data TEXT NOT NULL,
    is_offline INTEGER NOT NULL DEFAULT 0,
    is_pending INTEGER NOT NULL DEFAULT 0,
    stored_at TEXT NOT NULL
);
"#;

/// Queue of writes not yet confirmed by the remote authority.
const V2_PENDING_WRITES: &str = r#"
CREATE TABLE IF NOT EXISTS pending_writes (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    story_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_writes_status ON pending_writes(status, local_id);
CREATE INDEX IF NOT EXISTS idx_pending_writes_story ON pending_writes(story_id);
"#;

pub const MIGRATIONS: &[&str] = &[V1_STORIES, V2_PENDING_WRITES];
