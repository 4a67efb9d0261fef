use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::api_types::{ApiCreateStoryResponse, ApiListStoriesResponse, ApiStoryResponse};
use super::types::{NewStory, Story};
use crate::error::{Result, SyncError};

/// The backend that is the source of truth for story data.
///
/// The sync core only cares whether each call succeeded; response shapes
/// beyond "list of stories" and "single story" are ignored.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
  async fn list_stories(&self) -> Result<Vec<Story>>;

  async fn get_story(&self, id: &str) -> Result<Story>;

  /// Create a story. Returns the created story when the backend echoes it.
  async fn create_story(&self, story: &NewStory) -> Result<Option<Story>>;

  async fn delete_story(&self, id: &str) -> Result<()>;

  async fn like_story(&self, id: &str) -> Result<()>;

  async fn comment_story(&self, id: &str, text: &str) -> Result<()>;

  async fn subscribe_story(&self, id: &str) -> Result<()>;
}

/// Story API client wrapper
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct StoryApiClient {
  client: Client,
  base_url: String,
  token: Option<String>,
}

impl StoryApiClient {
  pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      token,
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }

  fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  /// Send a request, turning non-2xx statuses into `RemoteRejection`.
  async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
    let response = self.authorized(builder).send().await?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::from_status(status.as_u16(), &body))
  }

  async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
    let response = self.send(builder).await?;
    response
      .json()
      .await
      .map_err(|e| SyncError::NetworkFailure(format!("Failed to parse response: {}", e)))
  }
}

#[async_trait]
impl RemoteAuthority for StoryApiClient {
  async fn list_stories(&self) -> Result<Vec<Story>> {
    let response: ApiListStoriesResponse = self
      .send_json(self.client.get(self.url("/stories")))
      .await?;
    debug!(count = response.list_story.len(), "Fetched story list");
    Ok(response.list_story)
  }

  async fn get_story(&self, id: &str) -> Result<Story> {
    let response: ApiStoryResponse = self
      .send_json(self.client.get(self.url(&format!("/stories/{}", id))))
      .await?;
    debug!(id, error = response.error, message = %response.message, "Fetched story");
    Ok(response.story)
  }

  async fn create_story(&self, story: &NewStory) -> Result<Option<Story>> {
    let response = self
      .send(self.client.post(self.url("/stories")).json(story))
      .await?;

    // The 2xx status is the acceptance; the echoed story is optional
    let body = response.bytes().await.unwrap_or_default();
    match serde_json::from_slice::<ApiCreateStoryResponse>(&body) {
      Ok(created) => {
        debug!(error = created.error, message = %created.message, "Story created");
        Ok(created.story)
      }
      Err(e) => {
        debug!(error = %e, bytes = body.len(), "Story created, response body not readable");
        Ok(None)
      }
    }
  }

  async fn delete_story(&self, id: &str) -> Result<()> {
    self
      .send(self.client.delete(self.url(&format!("/stories/{}", id))))
      .await?;
    Ok(())
  }

  async fn like_story(&self, id: &str) -> Result<()> {
    self
      .send(self.client.post(self.url(&format!("/stories/{}/like", id))))
      .await?;
    Ok(())
  }

  async fn comment_story(&self, id: &str, text: &str) -> Result<()> {
    let body = serde_json::json!({ "text": text });
    self
      .send(
        self
          .client
          .post(self.url(&format!("/stories/{}/comments", id)))
          .json(&body),
      )
      .await?;
    Ok(())
  }

  async fn subscribe_story(&self, id: &str) -> Result<()> {
    self
      .send(self.client.post(self.url(&format!("/stories/{}/subscribe", id))))
      .await?;
    Ok(())
  }
}
