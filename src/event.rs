use tokio::sync::mpsc;

use crate::fetch::Request;
use crate::messenger::Inbound;
use crate::push::PushData;

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  /// A page posted a message
  Message(Inbound),
  /// Background or periodic sync fired with the given tag
  Sync(String),
  Push(Option<Vec<u8>>),
  NotificationClick(PushData),
}

/// Merges page traffic and externally raised events into one stream
pub struct EventHandler {
  inbound: mpsc::UnboundedReceiver<Inbound>,
  external: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl EventHandler {
  /// Wrap the messenger's inbound queue. The returned sender raises the
  /// remaining events (install, fetch, sync, push...).
  pub fn new(inbound: mpsc::UnboundedReceiver<Inbound>) -> (Self, mpsc::UnboundedSender<WorkerEvent>) {
    let (tx, external) = mpsc::unbounded_channel();
    (Self { inbound, external }, tx)
  }

  /// Receive the next event; `None` once both sources are closed
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    tokio::select! {
      Some(message) = self.inbound.recv() => Some(WorkerEvent::Message(message)),
      Some(event) = self.external.recv() => Some(event),
      else => None,
    }
  }

  /// Next already queued event, without waiting
  pub fn try_next(&mut self) -> Option<WorkerEvent> {
    self
      .inbound
      .try_recv()
      .ok()
      .map(WorkerEvent::Message)
      .or_else(|| self.external.try_recv().ok())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_merges_both_sources() {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (mut events, external) = EventHandler::new(inbound_rx);

    inbound_tx
      .send(Inbound {
        client_id: 1,
        raw: "{}".to_string(),
      })
      .unwrap();
    external.send(WorkerEvent::Sync("sync-stories".to_string())).unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.try_next() {
      seen.push(event);
    }
    assert_eq!(seen.len(), 2);
    assert!(matches!(seen[0], WorkerEvent::Message(_)));
    assert!(matches!(&seen[1], WorkerEvent::Sync(tag) if tag == "sync-stories"));
  }

  #[tokio::test]
  async fn test_ends_when_sources_close() {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
    let (mut events, external) = EventHandler::new(inbound_rx);
    drop(inbound_tx);
    drop(external);
    assert!(events.next().await.is_none());
  }
}
