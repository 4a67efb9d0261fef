//! Wire messages exchanged between the worker and page contexts.

use serde::{Deserialize, Serialize};

use crate::db::StoryRecord;
use crate::error::{Result, SyncError};
use crate::push::PushPayload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
  pub is_online: bool,
  /// Epoch millis
  pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineStories {
  pub stories: Vec<StoryRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStory {
  pub story_id: String,
  pub story_data: serde_json::Value,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
  pub succeeded: usize,
  pub failed: usize,
}

/// Every message the two sides may exchange. Anything else on the wire is a
/// protocol violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
  NetworkStatus(NetworkStatus),
  GetOfflineStories,
  OfflineStoriesResponse(OfflineStories),
  CacheStory(CacheStory),
  SyncCompleted(SyncSummary),
  PushNotification(PushPayload),
}

impl Message {
  pub fn encode(&self) -> Result<String> {
    serde_json::to_string(self)
      .map_err(|e| SyncError::ProtocolViolation(format!("Failed to encode message: {}", e)))
  }

  pub fn decode(raw: &str) -> Result<Self> {
    serde_json::from_str(raw)
      .map_err(|e| SyncError::ProtocolViolation(format!("Undecodable message: {}", e)))
  }

  /// Whether the worker is the sending side of this message type.
  pub fn is_from_worker(&self) -> bool {
    !matches!(
      self,
      Self::OfflineStoriesResponse(_) | Self::CacheStory(_)
    )
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      Self::NetworkStatus(_) => "network-status",
      Self::GetOfflineStories => "get-offline-stories",
      Self::OfflineStoriesResponse(_) => "offline-stories-response",
      Self::CacheStory(_) => "cache-story",
      Self::SyncCompleted(_) => "sync-completed",
      Self::PushNotification(_) => "push-notification",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_envelope_shape() {
    let raw = Message::SyncCompleted(SyncSummary {
      succeeded: 2,
      failed: 1,
    })
    .encode()
    .unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
      value,
      json!({"type": "sync-completed", "payload": {"succeeded": 2, "failed": 1}})
    );
  }

  #[test]
  fn test_unit_message_has_no_payload() {
    let raw = Message::GetOfflineStories.encode().unwrap();
    assert_eq!(raw, r#"{"type":"get-offline-stories"}"#);
    assert_eq!(Message::decode(&raw).unwrap(), Message::GetOfflineStories);
  }

  #[test]
  fn test_decode_page_message() {
    let message = Message::decode(
      r#"{"type":"cache-story","payload":{"storyId":"story-1","storyData":{"id":"story-1"}}}"#,
    )
    .unwrap();
    match &message {
      Message::CacheStory(cache) => {
        assert_eq!(cache.story_id, "story-1");
        assert_eq!(cache.story_data["id"], "story-1");
      }
      other => panic!("unexpected message {:?}", other),
    }
    assert!(!message.is_from_worker());
  }

  #[test]
  fn test_network_status_camel_case() {
    let raw = Message::NetworkStatus(NetworkStatus {
      is_online: false,
      timestamp: 1_700_000_000_000,
    })
    .encode()
    .unwrap();
    assert!(raw.contains(r#""isOnline":false"#));
  }

  #[test]
  fn test_unknown_type_is_violation() {
    let err = Message::decode(r#"{"type":"skip-waiting"}"#).unwrap_err();
    assert!(matches!(err, SyncError::ProtocolViolation(_)));
  }

  #[test]
  fn test_malformed_payload_is_violation() {
    let err = Message::decode(r#"{"type":"sync-completed","payload":{"succeeded":"two"}}"#)
      .unwrap_err();
    assert!(matches!(err, SyncError::ProtocolViolation(_)));
  }
}
