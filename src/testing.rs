//! Scripted network and remote authority for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::fetch::{Network, Request, Response};
use crate::remote::{NewStory, RemoteAuthority, Story};

pub fn test_config() -> Config {
  Config {
    origin: "http://localhost:8080".to_string(),
    ..Config::default()
  }
}

pub fn story(id: &str) -> Story {
  Story {
    id: id.to_string(),
    name: "Ana".to_string(),
    description: format!("story {}", id),
    photo_url: None,
    created_at: None,
    lat: None,
    lon: None,
  }
}

pub fn new_story(description: &str) -> NewStory {
  NewStory {
    description: description.to_string(),
    photo: None,
    lat: None,
    lon: None,
  }
}

/// Network answering from a table of URL -> response. Unknown URLs get a 404;
/// while offline every request fails at the transport level.
#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: Mutex<Vec<String>>,
}

impl MockNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Response::new(status, body));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let key = request.cache_key();
    self.calls.lock().unwrap().push(key.clone());
    if self.offline.load(Ordering::SeqCst) {
      return Err(SyncError::NetworkFailure("connection refused".to_string()));
    }
    let routes = self.routes.lock().unwrap();
    Ok(
      routes
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "Not Found")),
    )
  }
}

/// Remote authority keeping stories in memory.
#[derive(Default)]
pub struct MockRemote {
  pub stories: Mutex<Vec<Story>>,
  pub deleted: Mutex<Vec<String>>,
  /// Create calls whose description matches are rejected with a 400
  rejected: Mutex<Vec<String>>,
  offline: AtomicBool,
  next_id: AtomicUsize,
  /// When set, creates wait for a notification before answering
  hold: Mutex<Option<Arc<Notify>>>,
}

impl MockRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn reject(&self, description: &str) {
    self.rejected.lock().unwrap().push(description.to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn hold_creates(&self) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    *self.hold.lock().unwrap() = Some(notify.clone());
    notify
  }

  fn check_online(&self) -> Result<()> {
    if self.offline.load(Ordering::SeqCst) {
      return Err(SyncError::NetworkFailure("connection refused".to_string()));
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteAuthority for MockRemote {
  async fn list_stories(&self) -> Result<Vec<Story>> {
    self.check_online()?;
    Ok(self.stories.lock().unwrap().clone())
  }

  async fn get_story(&self, id: &str) -> Result<Story> {
    self.check_online()?;
    self
      .stories
      .lock()
      .unwrap()
      .iter()
      .find(|s| s.id == id)
      .cloned()
      .ok_or_else(|| SyncError::from_status(404, "Story not found"))
  }

  async fn create_story(&self, new_story: &NewStory) -> Result<Option<Story>> {
    let hold = self.hold.lock().unwrap().clone();
    if let Some(notify) = hold {
      notify.notified().await;
    }
    self.check_online()?;
    if self.rejected.lock().unwrap().contains(&new_story.description) {
      return Err(SyncError::from_status(400, "Bad Request"));
    }
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let created = Story {
      id: format!("story-{}", id),
      name: "You".to_string(),
      description: new_story.description.clone(),
      photo_url: None,
      created_at: None,
      lat: new_story.lat,
      lon: new_story.lon,
    };
    self.stories.lock().unwrap().push(created.clone());
    Ok(Some(created))
  }

  async fn delete_story(&self, id: &str) -> Result<()> {
    self.check_online()?;
    self.stories.lock().unwrap().retain(|s| s.id != id);
    self.deleted.lock().unwrap().push(id.to_string());
    Ok(())
  }

  async fn like_story(&self, _id: &str) -> Result<()> {
    self.check_online()
  }

  async fn comment_story(&self, _id: &str, _text: &str) -> Result<()> {
    self.check_online()
  }

  async fn subscribe_story(&self, _id: &str) -> Result<()> {
    self.check_online()
  }
}
