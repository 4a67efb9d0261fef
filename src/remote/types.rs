use serde::{Deserialize, Serialize};

/// A story as the remote authority knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub photo_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_at: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lat: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lon: Option<f64>,
}

/// Data submitted when creating a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStory {
  pub description: String,
  /// Photo as a base64 data URL
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub photo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lat: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lon: Option<f64>,
}
