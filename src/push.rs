//! Push payload decoding and notification routing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::messenger::ClientInfo;

const DEFAULT_TITLE: &str = "Story Update";
const DEFAULT_BODY: &str = "There are new story updates";
const DEFAULT_ICON: &str = "/images/icon-192x192.png";
const DEFAULT_BADGE: &str = "/images/icon-192x192.png";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
  #[serde(default = "default_url")]
  pub url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub story_id: Option<String>,
}

fn default_url() -> String {
  "/".to_string()
}

impl Default for PushData {
  fn default() -> Self {
    Self {
      url: default_url(),
      story_id: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushPayload {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub data: PushData,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub force_show: Option<bool>,
}

impl Default for PushPayload {
  fn default() -> Self {
    Self {
      title: DEFAULT_TITLE.to_string(),
      body: DEFAULT_BODY.to_string(),
      icon: DEFAULT_ICON.to_string(),
      badge: DEFAULT_BADGE.to_string(),
      data: PushData::default(),
      force_show: None,
    }
  }
}

impl PushPayload {
  /// Decode the raw push data. Missing or undecodable data yields the
  /// generic update notification.
  pub fn decode(data: Option<&[u8]>) -> Self {
    let Some(bytes) = data else {
      return Self::default();
    };
    match serde_json::from_slice(bytes) {
      Ok(payload) => payload,
      Err(e) => {
        debug!(error = %e, "Push data is not a payload, using defaults");
        Self::default()
      }
    }
  }

  pub fn force_show(&self) -> bool {
    self.force_show.unwrap_or(false)
  }
}

/// A system notification to display.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub data: PushData,
}

impl From<&PushPayload> for Notification {
  fn from(payload: &PushPayload) -> Self {
    Self {
      title: payload.title.clone(),
      body: payload.body.clone(),
      icon: payload.icon.clone(),
      badge: payload.badge.clone(),
      data: payload.data.clone(),
    }
  }
}

/// What the worker did with a push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
  /// Pages that received a `push-notification` message
  pub forwarded_to: usize,
  /// System notification shown, if any
  pub shown: Option<Notification>,
}

/// Decide how a push is surfaced: pages that are open get the message and
/// only see a system notification when it is forced; with no pages open
/// the notification is always shown.
pub fn route(payload: &PushPayload, connected_clients: usize) -> PushOutcome {
  if connected_clients > 0 {
    PushOutcome {
      forwarded_to: connected_clients,
      shown: payload.force_show().then(|| Notification::from(payload)),
    }
  } else {
    PushOutcome {
      forwarded_to: 0,
      shown: Some(Notification::from(payload)),
    }
  }
}

/// Result of clicking a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickAction {
  /// Bring an open page already at the URL to the front
  Focus(u64),
  /// Open a new window at the URL
  Open(String),
}

/// Resolve a notification click against the open pages.
pub fn resolve_click(target_url: &str, clients: &[ClientInfo]) -> ClickAction {
  clients
    .iter()
    .find(|client| client.url == target_url)
    .map(|client| ClickAction::Focus(client.id))
    .unwrap_or_else(|| ClickAction::Open(target_url.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client(id: u64, url: &str) -> ClientInfo {
    ClientInfo {
      id,
      url: url.to_string(),
      controlled: true,
    }
  }

  #[test]
  fn test_decode_missing_data_uses_defaults() {
    let payload = PushPayload::decode(None);
    assert_eq!(payload.title, "Story Update");
    assert_eq!(payload.body, "There are new story updates");
    assert_eq!(payload.data.url, "/");
  }

  #[test]
  fn test_decode_garbage_uses_defaults() {
    let payload = PushPayload::decode(Some(b"not json"));
    assert_eq!(payload, PushPayload::default());
  }

  #[test]
  fn test_decode_partial_payload() {
    let payload = PushPayload::decode(Some(
      br#"{"title":"New story","data":{"url":"/#/stories/42","storyId":"42"},"forceShow":true}"#,
    ));
    assert_eq!(payload.title, "New story");
    assert_eq!(payload.body, "There are new story updates");
    assert_eq!(payload.data.story_id.as_deref(), Some("42"));
    assert!(payload.force_show());
  }

  #[test]
  fn test_route_with_open_pages() {
    let payload = PushPayload::default();
    let outcome = route(&payload, 2);
    assert_eq!(outcome.forwarded_to, 2);
    assert!(outcome.shown.is_none());

    let forced = PushPayload {
      force_show: Some(true),
      ..PushPayload::default()
    };
    assert!(route(&forced, 1).shown.is_some());
  }

  #[test]
  fn test_route_without_pages_shows_notification() {
    let outcome = route(&PushPayload::default(), 0);
    assert_eq!(outcome.forwarded_to, 0);
    assert_eq!(outcome.shown.unwrap().title, "Story Update");
  }

  #[test]
  fn test_click_focuses_matching_client() {
    let clients = vec![
      client(1, "http://localhost:8080/"),
      client(2, "http://localhost:8080/#/stories/42"),
    ];
    assert_eq!(
      resolve_click("http://localhost:8080/#/stories/42", &clients),
      ClickAction::Focus(2)
    );
    assert_eq!(
      resolve_click("http://localhost:8080/#/add", &clients),
      ClickAction::Open("http://localhost:8080/#/add".to_string())
    );
  }
}
