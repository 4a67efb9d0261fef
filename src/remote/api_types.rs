//! Serde-deserializable types matching the story API responses.
//!
//! Every response carries an `error` flag and a `message`; the payload key
//! depends on the endpoint.

use serde::{Deserialize, Serialize};

use super::types::Story;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiListStoriesResponse {
  #[serde(default)]
  pub error: bool,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub list_story: Vec<Story>,
}

impl ApiListStoriesResponse {
  /// Body the worker stores into the API partition when pages hand it
  /// their offline copy of the list.
  pub fn from_offline(stories: Vec<Story>) -> Self {
    Self {
      error: false,
      message: "Stories fetched from offline cache".to_string(),
      list_story: stories,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiStoryResponse {
  #[serde(default)]
  pub error: bool,
  #[serde(default)]
  pub message: String,
  pub story: Story,
}

/// Create responses may or may not echo the created story.
#[derive(Debug, Deserialize)]
pub struct ApiCreateStoryResponse {
  #[serde(default)]
  pub error: bool,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub story: Option<Story>,
}
