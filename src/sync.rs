//! Replays queued writes against the remote authority.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::{Database, PendingKind, PendingStatus, PendingWrite};
use crate::error::Result;
use crate::messenger::{Message, Messenger, SyncSummary};
use crate::remote::RemoteAuthority;

pub struct SyncCoordinator {
  db: Arc<Database>,
  remote: Arc<dyn RemoteAuthority>,
  messenger: Messenger,
  retry_ceiling: u32,
  /// Held for the duration of a pass
  running: Mutex<()>,
}

impl SyncCoordinator {
  pub fn new(
    db: Arc<Database>,
    remote: Arc<dyn RemoteAuthority>,
    messenger: Messenger,
    retry_ceiling: u32,
  ) -> Self {
    Self {
      db,
      remote,
      messenger,
      retry_ceiling,
      running: Mutex::new(()),
    }
  }

  /// Drain the queue once, oldest write first.
  ///
  /// Returns `None` without doing anything when another pass is running.
  /// Each write succeeds or fails on its own; pages receive one
  /// `sync-completed` per pass.
  pub async fn run(&self) -> Result<Option<SyncSummary>> {
    let Ok(_guard) = self.running.try_lock() else {
      debug!("Sync pass already running");
      return Ok(None);
    };

    let writes = self.db.pending_writes()?;
    let mut summary = SyncSummary::default();

    for queued in &writes {
      // Earlier replays may have retargeted or dropped this write
      let Some(write) = self.db.get_pending(queued.local_id)? else {
        continue;
      };
      if write.status != PendingStatus::Pending {
        continue;
      }
      let write = &write;
      match self.replay(write).await {
        Ok(()) => summary.succeeded += 1,
        Err(e) => {
          warn!(
            local_id = write.local_id,
            kind = write.kind.as_str(),
            story_id = %write.story_id,
            error = %e,
            "Pending write failed"
          );
          summary.failed += 1;
        }
      }
    }

    info!(
      succeeded = summary.succeeded,
      failed = summary.failed,
      "Sync pass completed"
    );
    self.messenger.broadcast(&Message::SyncCompleted(summary));
    Ok(Some(summary))
  }

  async fn replay(&self, write: &PendingWrite) -> Result<()> {
    self.db.mark_syncing(write.local_id)?;

    let outcome = match write.kind {
      PendingKind::Create => match write.new_story() {
        Ok(story) => self.remote.create_story(&story).await,
        Err(e) => Err(e),
      },
      PendingKind::Delete => self.remote.delete_story(&write.story_id).await.map(|_| None),
    };

    match outcome {
      Ok(created) => self.db.complete(write, created.as_ref()),
      Err(e) => {
        let status = self
          .db
          .record_failure(write.local_id, &e.to_string(), self.retry_ceiling)?;
        if status == PendingStatus::Failed {
          warn!(local_id = write.local_id, "Pending write reached the retry ceiling");
        }
        Err(e)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::StoryRecord;
  use crate::testing::{new_story, story, MockRemote};
  use std::time::Duration;

  fn coordinator(remote: Arc<MockRemote>, ceiling: u32) -> (Arc<SyncCoordinator>, Arc<Database>, Messenger) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let (messenger, _inbound) = Messenger::new();
    let sync = Arc::new(SyncCoordinator::new(db.clone(), remote, messenger.clone(), ceiling));
    (sync, db, messenger)
  }

  fn completions(page: &mut crate::messenger::PageChannel) -> Vec<SyncSummary> {
    std::iter::from_fn(|| page.try_recv())
      .filter_map(|message| match message {
        Message::SyncCompleted(summary) => Some(summary),
        _ => None,
      })
      .collect()
  }

  #[tokio::test]
  async fn test_failure_is_isolated_per_item() {
    let remote = MockRemote::new();
    remote.reject("second");
    let (sync, db, messenger) = coordinator(remote.clone(), 5);
    let mut page = messenger.connect("http://localhost:8080/");

    let (first, _) = db.enqueue_create(&new_story("first"), "You").unwrap();
    let (second, _) = db.enqueue_create(&new_story("second"), "You").unwrap();
    let (third, _) = db.enqueue_create(&new_story("third"), "You").unwrap();

    let summary = sync.run().await.unwrap().unwrap();
    assert_eq!(summary, SyncSummary { succeeded: 2, failed: 1 });

    assert!(db.get_pending(first.local_id).unwrap().is_none());
    assert!(db.get_pending(third.local_id).unwrap().is_none());
    let remaining = db.get_pending(second.local_id).unwrap().unwrap();
    assert_eq!(remaining.retry_count, 1);
    assert_eq!(remaining.status, PendingStatus::Pending);

    assert_eq!(completions(&mut page), vec![SyncSummary { succeeded: 2, failed: 1 }]);

    let descriptions: Vec<String> = remote
      .stories
      .lock()
      .unwrap()
      .iter()
      .map(|s| s.description.clone())
      .collect();
    assert_eq!(descriptions, vec!["first", "third"]);
  }

  #[tokio::test]
  async fn test_ceiling_marks_write_failed() {
    let remote = MockRemote::new();
    remote.reject("doomed");
    let (sync, db, _messenger) = coordinator(remote, 2);
    let (write, _) = db.enqueue_create(&new_story("doomed"), "You").unwrap();

    sync.run().await.unwrap();
    assert_eq!(db.get_pending(write.local_id).unwrap().unwrap().status, PendingStatus::Pending);

    sync.run().await.unwrap();
    let failed = db.get_pending(write.local_id).unwrap().unwrap();
    assert_eq!(failed.status, PendingStatus::Failed);
    assert_eq!(failed.retry_count, 2);

    // Failed writes are left out of later passes
    let summary = sync.run().await.unwrap().unwrap();
    assert_eq!(summary, SyncSummary::default());
  }

  #[tokio::test]
  async fn test_network_failure_counts_toward_ceiling() {
    let remote = MockRemote::new();
    remote.set_offline(true);
    let (sync, db, _messenger) = coordinator(remote, 5);
    let (write, _) = db.enqueue_create(&new_story("later"), "You").unwrap();

    let summary = sync.run().await.unwrap().unwrap();
    assert_eq!(summary.failed, 1);
    let pending = db.get_pending(write.local_id).unwrap().unwrap();
    assert_eq!(pending.retry_count, 1);
    assert!(pending.last_error.unwrap().contains("connection refused"));
  }

  #[tokio::test]
  async fn test_delete_replay_removes_story() {
    let remote = MockRemote::new();
    remote.stories.lock().unwrap().push(story("story-7"));
    let (sync, db, _messenger) = coordinator(remote.clone(), 5);
    db.put(&StoryRecord::remote(story("story-7"))).unwrap();
    db.mark_pending("story-7", PendingKind::Delete).unwrap();

    sync.run().await.unwrap();

    assert!(db.get("story-7").unwrap().is_none());
    assert_eq!(*remote.deleted.lock().unwrap(), vec!["story-7".to_string()]);
  }

  #[tokio::test]
  async fn test_concurrent_trigger_is_noop() {
    let remote = MockRemote::new();
    let release = remote.hold_creates();
    let (sync, db, messenger) = coordinator(remote, 5);
    let mut page = messenger.connect("http://localhost:8080/");
    db.enqueue_create(&new_story("slow"), "You").unwrap();

    let background = {
      let sync = sync.clone();
      tokio::spawn(async move { sync.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(sync.run().await.unwrap().is_none());

    release.notify_one();
    let summary = background.await.unwrap().unwrap().unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(completions(&mut page).len(), 1);
  }

  #[tokio::test]
  async fn test_delete_while_create_in_flight_is_not_lost() {
    let remote = MockRemote::new();
    let release = remote.hold_creates();
    let (sync, db, _messenger) = coordinator(remote.clone(), 5);
    let (write, _) = db.enqueue_create(&new_story("regret"), "You").unwrap();

    let background = {
      let sync = sync.clone();
      tokio::spawn(async move { sync.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queued = db.mark_pending(&write.story_id, PendingKind::Delete).unwrap();
    assert!(queued.is_some());

    release.notify_one();
    let summary = background.await.unwrap().unwrap().unwrap();
    assert_eq!(summary, SyncSummary { succeeded: 1, failed: 0 });
    assert_eq!(db.pending_writes().unwrap()[0].story_id, "story-1");

    let summary = sync.run().await.unwrap().unwrap();
    assert_eq!(summary, SyncSummary { succeeded: 1, failed: 0 });
    assert!(db.get_all().unwrap().is_empty());
    assert!(db.all_writes().unwrap().is_empty());
    assert!(remote.stories.lock().unwrap().is_empty());
    assert_eq!(*remote.deleted.lock().unwrap(), vec!["story-1".to_string()]);
  }

  #[tokio::test]
  async fn test_retargeted_delete_replays_in_same_pass() {
    let remote = MockRemote::new();
    let (sync, db, _messenger) = coordinator(remote.clone(), 5);
    let (create, _) = db.enqueue_create(&new_story("interrupted"), "You").unwrap();

    // The create was in flight when the delete arrived, then failed
    db.mark_syncing(create.local_id).unwrap();
    db.mark_pending(&create.story_id, PendingKind::Delete).unwrap().unwrap();
    db.record_failure(create.local_id, "timeout", 5).unwrap();

    let summary = sync.run().await.unwrap().unwrap();
    assert_eq!(summary, SyncSummary { succeeded: 2, failed: 0 });
    assert_eq!(*remote.deleted.lock().unwrap(), vec!["story-1".to_string()]);
    assert!(db.get_all().unwrap().is_empty());
    assert!(db.all_writes().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_created_story_replaces_shadow() {
    let remote = MockRemote::new();
    let (sync, db, _messenger) = coordinator(remote, 5);
    let (write, _) = db.enqueue_create(&new_story("sunset"), "You").unwrap();

    sync.run().await.unwrap();

    let stories = db.get_all().unwrap();
    assert_eq!(stories.len(), 1);
    assert_eq!(stories[0].id(), "story-1");
    assert!(!stories[0].is_offline && !stories[0].is_pending);
    assert!(db.get(&write.story_id).unwrap().is_none());
  }
}
