//! The background worker: owns the cache catalog, the strategy engine, the
//! lifecycle and the sync coordinator, and reacts to every event the
//! runtime delivers.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheCatalog, CacheGeneration, PartitionKind};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::event::{EventHandler, WorkerEvent};
use crate::fetch::{Network, Request, Response};
use crate::lifecycle::LifecycleManager;
use crate::messenger::{Inbound, Message, Messenger, SyncSummary};
use crate::push::{self, ClickAction, PushData, PushOutcome, PushPayload};
use crate::remote::api_types::ApiListStoriesResponse;
use crate::remote::RemoteAuthority;
use crate::strategy::StrategyEngine;
use crate::sync::SyncCoordinator;

/// What a handled event produced.
#[derive(Debug)]
pub enum WorkerReply {
  Done,
  Response(Response),
  Synced(Option<SyncSummary>),
  Refreshed(usize),
  Push(PushOutcome),
  Click(ClickAction),
}

pub struct Worker {
  config: Arc<Config>,
  generation: CacheGeneration,
  catalog: Arc<dyn CacheCatalog>,
  db: Arc<Database>,
  engine: StrategyEngine,
  lifecycle: LifecycleManager,
  sync: Arc<SyncCoordinator>,
  messenger: Messenger,
}

impl Worker {
  pub fn new(
    config: Arc<Config>,
    catalog: Arc<dyn CacheCatalog>,
    db: Arc<Database>,
    network: Arc<dyn Network>,
    remote: Arc<dyn RemoteAuthority>,
    messenger: Messenger,
  ) -> Self {
    let engine = StrategyEngine::new(
      catalog.clone(),
      network.clone(),
      messenger.clone(),
      config.clone(),
    );
    let lifecycle = LifecycleManager::new(catalog.clone(), network, messenger.clone(), config.clone());
    let sync = Arc::new(SyncCoordinator::new(
      db.clone(),
      remote,
      messenger.clone(),
      config.sync.retry_ceiling,
    ));

    Self {
      generation: config.generation(),
      config,
      catalog,
      db,
      engine,
      lifecycle,
      sync,
      messenger,
    }
  }

  pub fn lifecycle(&self) -> &LifecycleManager {
    &self.lifecycle
  }

  pub async fn dispatch(&self, event: WorkerEvent) -> Result<WorkerReply> {
    match event {
      WorkerEvent::Install => self.on_install().await.map(|_| WorkerReply::Done),
      WorkerEvent::Activate => self.on_activate().await.map(|_| WorkerReply::Done),
      WorkerEvent::Fetch(request) => Ok(WorkerReply::Response(self.on_fetch(&request).await)),
      WorkerEvent::Message(inbound) => self.on_message(&inbound).await.map(|_| WorkerReply::Done),
      WorkerEvent::Sync(tag) => self.on_sync(&tag).await,
      WorkerEvent::Push(data) => Ok(WorkerReply::Push(self.on_push(data.as_deref()))),
      WorkerEvent::NotificationClick(data) => {
        Ok(WorkerReply::Click(self.on_notification_click(&data)))
      }
    }
  }

  /// Handle events until every source is closed.
  pub async fn run(self: Arc<Self>, mut events: EventHandler) {
    while let Some(event) = events.next().await {
      if let Err(e) = self.dispatch(event).await {
        warn!(error = %e, "Worker event failed");
      }
    }
    debug!("Worker event loop finished");
  }

  /// Handle every event already queued. Returns how many were handled.
  pub async fn drain(&self, events: &mut EventHandler) -> usize {
    let mut handled = 0;
    while let Some(event) = events.try_next() {
      if let Err(e) = self.dispatch(event).await {
        warn!(error = %e, "Worker event failed");
      }
      handled += 1;
    }
    handled
  }

  pub async fn on_install(&self) -> Result<()> {
    self.lifecycle.install().await
  }

  pub async fn on_activate(&self) -> Result<()> {
    self.lifecycle.activate().await
  }

  /// Answer a request, then keep working until background revalidations
  /// have landed.
  pub async fn on_fetch(&self, request: &Request) -> Response {
    let response = self.engine.handle(request).await;
    self.engine.settle().await;
    response
  }

  /// Handle a message posted by a page. Messages that do not belong on
  /// this side of the channel are logged and dropped.
  pub async fn on_message(&self, inbound: &Inbound) -> Result<()> {
    let message = match inbound.decode() {
      Ok(message) => message,
      Err(e) => {
        warn!(client_id = inbound.client_id, error = %e, "Ignoring message");
        return Ok(());
      }
    };

    match message {
      Message::CacheStory(cache) => {
        let request = Request::get(&self.config.story_endpoint(&cache.story_id))?;
        self.store(PartitionKind::Runtime, &request, Response::json(&cache.story_data))?;
        debug!(story_id = %cache.story_id, "Cached story for offline reading");
      }
      Message::OfflineStoriesResponse(offline) => {
        let body = ApiListStoriesResponse::from_offline(
          offline.stories.into_iter().map(|record| record.story).collect(),
        );
        let value = serde_json::to_value(&body)
          .map_err(|e| SyncError::CacheFailure(format!("Failed to encode story list: {}", e)))?;
        let request = Request::get(&self.config.stories_endpoint())?;
        self.store(PartitionKind::Api, &request, Response::json(&value))?;
        debug!(stories = body.list_story.len(), "Refilled story list from page");
      }
      other => {
        warn!(
          client_id = inbound.client_id,
          message_type = other.type_name(),
          "Ignoring message meant for pages"
        );
      }
    }
    Ok(())
  }

  fn store(&self, kind: PartitionKind, request: &Request, response: Response) -> Result<()> {
    let partition = self.generation.partition_name(kind);
    self.catalog.put(&partition, request, &response)
  }

  /// Background sync drains the write queue; periodic sync refreshes the
  /// story list.
  pub async fn on_sync(&self, tag: &str) -> Result<WorkerReply> {
    if tag == self.config.sync.tag {
      return self.sync.run().await.map(WorkerReply::Synced);
    }
    if tag == self.config.sync.periodic_tag {
      return self.refresh_stories().await.map(WorkerReply::Refreshed);
    }
    debug!(tag, "Ignoring unknown sync tag");
    Ok(WorkerReply::Done)
  }

  /// Fetch the story list through the strategy engine and rewrite the
  /// durable snapshot. Returns the number of stories.
  pub async fn refresh_stories(&self) -> Result<usize> {
    let mut request = Request::get(&self.config.stories_endpoint())?;
    if let Some(token) = Config::get_api_token() {
      request = request.with_header("Authorization", &format!("Bearer {}", token));
    }

    let response = self.on_fetch(&request).await;
    if !response.ok() {
      return Err(SyncError::from_status(response.status, &response.text()));
    }
    let list: ApiListStoriesResponse = serde_json::from_slice(&response.body)
      .map_err(|e| SyncError::ProtocolViolation(format!("Unexpected story list: {}", e)))?;

    self.db.replace_all(&list.list_story)?;
    info!(stories = list.list_story.len(), source = ?response.source, "Refreshed stories");
    Ok(list.list_story.len())
  }

  pub fn on_push(&self, data: Option<&[u8]>) -> PushOutcome {
    let payload = PushPayload::decode(data);
    let mut outcome = push::route(&payload, self.messenger.client_count());
    if outcome.forwarded_to > 0 {
      outcome.forwarded_to = self
        .messenger
        .broadcast(&Message::PushNotification(payload.clone()));
    }
    if let Some(notification) = &outcome.shown {
      info!(title = %notification.title, "Showing notification");
    }
    outcome
  }

  pub fn on_notification_click(&self, data: &PushData) -> ClickAction {
    let url = if data.url.starts_with('/') {
      self.config.absolute(&data.url)
    } else {
      data.url.clone()
    };
    let action = push::resolve_click(&url, &self.messenger.clients());
    debug!(?action, "Notification clicked");
    action
  }

  /// Run a sync pass whenever connectivity comes back.
  pub fn watch_connectivity(&self) -> JoinHandle<()> {
    let sync = self.sync.clone();
    let mut connectivity = self.messenger.subscribe();
    tokio::spawn(async move {
      let mut last = *connectivity.borrow_and_update();
      while connectivity.changed().await.is_ok() {
        let now = *connectivity.borrow_and_update();
        if last == Some(false) && now == Some(true) {
          info!("Connectivity restored, replaying pending writes");
          if let Err(e) = sync.run().await {
            warn!(error = %e, "Sync after reconnect failed");
          }
        }
        last = now;
      }
    })
  }
}
