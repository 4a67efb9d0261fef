use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::message::{Message, NetworkStatus};
use crate::error::{Result, SyncError};

/// A message a page posted to the worker, still encoded.
#[derive(Debug, Clone)]
pub struct Inbound {
  pub client_id: u64,
  pub raw: String,
}

impl Inbound {
  pub fn decode(&self) -> Result<Message> {
    Message::decode(&self.raw)
  }
}

/// A connected page as the worker sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  pub id: u64,
  pub url: String,
  /// Whether the current worker controls this page
  pub controlled: bool,
}

struct ClientSlot {
  info: ClientInfo,
  tx: mpsc::UnboundedSender<String>,
}

struct Inner {
  clients: Mutex<Vec<ClientSlot>>,
  next_id: AtomicU64,
  to_worker: mpsc::UnboundedSender<Inbound>,
  connectivity: watch::Sender<Option<bool>>,
}

/// Worker side of the channel between the worker and every open page.
///
/// Cloning is cheap; all clones share the client registry and the last
/// known connectivity.
#[derive(Clone)]
pub struct Messenger {
  inner: Arc<Inner>,
}

impl Messenger {
  /// Create the messenger and the receiving end of page-to-worker traffic.
  pub fn new() -> (Self, mpsc::UnboundedReceiver<Inbound>) {
    let (to_worker, inbound) = mpsc::unbounded_channel();
    let (connectivity, _) = watch::channel(None);
    let messenger = Self {
      inner: Arc::new(Inner {
        clients: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(1),
        to_worker,
        connectivity,
      }),
    };
    (messenger, inbound)
  }

  fn clients_lock(&self) -> MutexGuard<'_, Vec<ClientSlot>> {
    self
      .inner
      .clients
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Register a page open at `url`.
  pub fn connect(&self, url: &str) -> PageChannel {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    self.clients_lock().push(ClientSlot {
      info: ClientInfo {
        id,
        url: url.to_string(),
        controlled: false,
      },
      tx,
    });
    debug!(client_id = id, url, "Page connected");

    PageChannel {
      id,
      rx,
      to_worker: self.inner.to_worker.clone(),
    }
  }

  /// Deliver a message to every open page. Returns how many received it.
  pub fn broadcast(&self, message: &Message) -> usize {
    if !message.is_from_worker() {
      warn!(message_type = message.type_name(), "Refusing to send a page message to pages");
      return 0;
    }
    let raw = match message.encode() {
      Ok(raw) => raw,
      Err(e) => {
        warn!(error = %e, "Dropping broadcast");
        return 0;
      }
    };

    let mut clients = self.clients_lock();
    clients.retain(|slot| slot.tx.send(raw.clone()).is_ok());
    debug!(message_type = message.type_name(), clients = clients.len(), "Broadcast");
    clients.len()
  }

  /// Open pages, closed ones pruned.
  pub fn clients(&self) -> Vec<ClientInfo> {
    let mut clients = self.clients_lock();
    clients.retain(|slot| !slot.tx.is_closed());
    clients.iter().map(|slot| slot.info.clone()).collect()
  }

  pub fn client_count(&self) -> usize {
    self.clients().len()
  }

  /// Take control of every open page. Returns how many were claimed.
  pub fn claim(&self) -> usize {
    let mut clients = self.clients_lock();
    clients.retain(|slot| !slot.tx.is_closed());
    for slot in clients.iter_mut() {
      slot.info.controlled = true;
    }
    clients.len()
  }

  /// Record the outcome of a network attempt. Pages hear about it only when
  /// connectivity actually changed. Returns the previous state.
  pub fn report_connectivity(&self, online: bool) -> Option<bool> {
    let mut previous = None;
    let changed = self.inner.connectivity.send_if_modified(|state| {
      previous = *state;
      if *state == Some(online) {
        return false;
      }
      *state = Some(online);
      true
    });

    if changed {
      info!(online, "Connectivity changed");
      self.broadcast(&Message::NetworkStatus(NetworkStatus {
        is_online: online,
        timestamp: Utc::now().timestamp_millis(),
      }));
    }
    previous
  }

  /// Last known connectivity; `None` until the network was first touched.
  pub fn connectivity(&self) -> Option<bool> {
    *self.inner.connectivity.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.connectivity().unwrap_or(true)
  }

  /// Watch connectivity transitions.
  pub fn subscribe(&self) -> watch::Receiver<Option<bool>> {
    self.inner.connectivity.subscribe()
  }
}

/// Page side of the channel.
pub struct PageChannel {
  id: u64,
  rx: mpsc::UnboundedReceiver<String>,
  to_worker: mpsc::UnboundedSender<Inbound>,
}

impl PageChannel {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Post a message to the worker.
  pub fn post(&self, message: &Message) -> Result<()> {
    if message.is_from_worker() {
      return Err(SyncError::ProtocolViolation(format!(
        "Pages do not send '{}'",
        message.type_name()
      )));
    }
    self.post_raw(message.encode()?)
  }

  /// Post an already encoded message.
  pub fn post_raw(&self, raw: String) -> Result<()> {
    self
      .to_worker
      .send(Inbound {
        client_id: self.id,
        raw,
      })
      .map_err(|_| SyncError::ProtocolViolation("Worker is gone".to_string()))
  }

  /// Wait for the next valid message. Anything undecodable is logged and
  /// skipped.
  pub async fn recv(&mut self) -> Option<Message> {
    while let Some(raw) = self.rx.recv().await {
      match Message::decode(&raw) {
        Ok(message) => return Some(message),
        Err(e) => warn!(client_id = self.id, error = %e, "Ignoring message"),
      }
    }
    None
  }

  /// Next queued message, if any, without waiting.
  pub fn try_recv(&mut self) -> Option<Message> {
    while let Ok(raw) = self.rx.try_recv() {
      match Message::decode(&raw) {
        Ok(message) => return Some(message),
        Err(e) => warn!(client_id = self.id, error = %e, "Ignoring message"),
      }
    }
    None
  }
}
