//! Page side: story actions with an offline fallback, and the page's half
//! of the messenger protocol.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{Database, PendingKind, StoryRecord};
use crate::error::{Result, SyncError};
use crate::messenger::{CacheStory, Message, OfflineStories, PageChannel};
use crate::remote::{NewStory, RemoteAuthority, Story};

const DEFAULT_DISPLAY_NAME: &str = "You";

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  /// Accepted by the remote authority
  Published(Option<Story>),
  /// Saved locally, will sync when back online
  Queued(StoryRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
  Deleted,
  Queued,
  /// The story only existed offline; its pending create was dropped
  Cancelled,
}

pub struct PageContext {
  channel: PageChannel,
  db: Arc<Database>,
  remote: Arc<dyn RemoteAuthority>,
  display_name: String,
  online: bool,
  stories: Vec<StoryRecord>,
  toasts: Vec<String>,
}

impl PageContext {
  pub fn new(channel: PageChannel, db: Arc<Database>, remote: Arc<dyn RemoteAuthority>) -> Self {
    debug!(client_id = channel.id(), "Page connected");
    Self {
      channel,
      db,
      remote,
      display_name: DEFAULT_DISPLAY_NAME.to_string(),
      online: true,
      stories: Vec::new(),
      toasts: Vec::new(),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online
  }

  /// Stories currently on screen.
  pub fn stories(&self) -> &[StoryRecord] {
    &self.stories
  }

  /// Toasts shown since the last call.
  pub fn take_toasts(&mut self) -> Vec<String> {
    std::mem::take(&mut self.toasts)
  }

  fn toast(&mut self, text: impl Into<String>) {
    let text = text.into();
    info!(toast = %text, "Page notice");
    self.toasts.push(text);
  }

  /// Publish a story, or queue it when offline or when publishing fails.
  /// Fails only when the story could not be saved locally either.
  pub async fn submit_story(&mut self, story: NewStory, online: bool) -> Result<SubmitOutcome> {
    if online {
      match self.remote.create_story(&story).await {
        Ok(created) => {
          if let Some(created) = &created {
            self.db.put(&StoryRecord::remote(created.clone()))?;
            self.cache_story(created)?;
          }
          self.toast("Story published");
          return Ok(SubmitOutcome::Published(created));
        }
        Err(e) => warn!(error = %e, "Publishing failed, saving story offline"),
      }
    }

    let (write, record) = self.db.enqueue_create(&story, &self.display_name)?;
    debug!(local_id = write.local_id, story_id = %record.id(), "Story queued");
    self.stories.push(record.clone());
    self.toast("Story saved offline and will sync when you are back online");
    Ok(SubmitOutcome::Queued(record))
  }

  /// Hand a published story to the worker so it can be read offline.
  fn cache_story(&self, story: &Story) -> Result<()> {
    let story_data = serde_json::to_value(story)
      .map_err(|e| SyncError::ProtocolViolation(format!("Failed to encode story: {}", e)))?;
    self.channel.post(&Message::CacheStory(CacheStory {
      story_id: story.id.clone(),
      story_data,
    }))
  }

  pub async fn delete_story(&mut self, id: &str, online: bool) -> Result<DeleteOutcome> {
    let offline_only = self.db.get(id)?.is_some_and(|record| record.is_offline);

    if online && !offline_only {
      match self.remote.delete_story(id).await {
        Ok(()) => {
          self.db.delete(id)?;
          self.stories.retain(|record| record.id() != id);
          self.toast("Story deleted");
          return Ok(DeleteOutcome::Deleted);
        }
        Err(e) => warn!(story_id = %id, error = %e, "Delete failed, queueing it"),
      }
    }

    let outcome = match self.db.mark_pending(id, PendingKind::Delete)? {
      Some(_) => {
        self.toast("Story will be deleted when you are back online");
        DeleteOutcome::Queued
      }
      None => {
        self.toast("Offline story discarded");
        DeleteOutcome::Cancelled
      }
    };
    self.stories = self.db.get_all()?;
    Ok(outcome)
  }

  /// Refresh the on-screen list: from the remote authority when online,
  /// otherwise (or when that fails) from the durable store.
  pub async fn load_stories(&mut self, online: bool) -> Result<&[StoryRecord]> {
    if online {
      match self.remote.list_stories().await {
        Ok(stories) => self.db.replace_all(&stories)?,
        Err(e) => {
          warn!(error = %e, "Loading stories failed, showing offline copy");
          self.toast("Showing stories saved on this device");
        }
      }
    }
    self.stories = self.db.get_all()?;
    Ok(&self.stories)
  }

  /// React to a message from the worker.
  pub fn handle_message(&mut self, message: Message) -> Result<()> {
    match message {
      Message::GetOfflineStories => {
        let stories = self.db.get_all()?;
        debug!(stories = stories.len(), "Answering worker with offline stories");
        self
          .channel
          .post(&Message::OfflineStoriesResponse(OfflineStories { stories }))?;
      }
      Message::SyncCompleted(summary) => {
        self.stories = self.db.get_all()?;
        if summary.succeeded > 0 {
          self.toast(format!("{} stories synced", summary.succeeded));
        }
        if summary.failed > 0 {
          self.toast(format!("{} stories failed to sync", summary.failed));
        }
      }
      Message::NetworkStatus(status) => {
        self.online = status.is_online;
        self.toast(if status.is_online {
          "You are back online"
        } else {
          "You are offline"
        });
      }
      Message::PushNotification(payload) => {
        self.toast(format!("{}: {}", payload.title, payload.body));
      }
      other => {
        warn!(message_type = other.type_name(), "Ignoring message meant for the worker");
      }
    }
    Ok(())
  }

  /// Wait for the next message from the worker and handle it. Returns
  /// false once the worker is gone.
  pub async fn next_message(&mut self) -> Result<bool> {
    match self.channel.recv().await {
      Some(message) => {
        self.handle_message(message)?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Handle every message already delivered. Returns how many were handled.
  pub fn pump(&mut self) -> Result<usize> {
    let mut handled = 0;
    while let Some(message) = self.channel.try_recv() {
      self.handle_message(message)?;
      handled += 1;
    }
    Ok(handled)
  }
}
