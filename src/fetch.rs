//! Request/response model shared by the strategy engine, the cache catalog
//! and the network layer.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::error::{Result, SyncError};

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Some(Self::Get),
      "HEAD" => Some(Self::Head),
      "POST" => Some(Self::Post),
      "PUT" => Some(Self::Put),
      "PATCH" => Some(Self::Patch),
      "DELETE" => Some(Self::Delete),
      "OPTIONS" => Some(Self::Options),
      _ => None,
    }
  }
}

/// What the requesting context intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  /// fetch()/XHR, no declared destination
  #[default]
  Empty,
  Document,
  Style,
  Script,
  Font,
  Image,
  Manifest,
  Worker,
  Audio,
  Video,
}

impl Destination {
  pub fn parse(s: &str) -> Self {
    match s.to_ascii_lowercase().as_str() {
      "document" => Self::Document,
      "style" => Self::Style,
      "script" => Self::Script,
      "font" => Self::Font,
      "image" => Self::Image,
      "manifest" => Self::Manifest,
      "worker" => Self::Worker,
      "audio" => Self::Audio,
      "video" => Self::Video,
      _ => Self::Empty,
    }
  }

  /// Static assets that are safe to serve cache-first.
  pub fn is_static_asset(&self) -> bool {
    matches!(self, Self::Style | Self::Script | Self::Font | Self::Image)
  }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: &str) -> Result<Self> {
    let url = Url::parse(url)
      .map_err(|e| SyncError::ProtocolViolation(format!("Invalid request URL '{}': {}", url, e)))?;
    Ok(Self {
      method,
      url,
      destination: Destination::Empty,
      headers: Vec::new(),
      body: None,
    })
  }

  pub fn get(url: &str) -> Result<Self> {
    Self::new(Method::Get, url)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Normalized absolute URL used as the cache key (fragment stripped).
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  /// Origin serialized as `scheme://host[:port]`.
  pub fn origin(&self) -> String {
    self.url.origin().ascii_serialization()
  }

  /// Only http(s) requests can be intercepted; anything else (extensions,
  /// data URLs) passes straight through.
  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}

/// Where a response ended up coming from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from a cache partition
  Cache,
  /// Offline document or placeholder served in place of the real resource
  Fallback,
  /// Produced locally because nothing else was available
  Synthetic,
}

/// A response snapshot. Cloning it is how a response is both returned and
/// stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  pub fn json(value: &serde_json::Value) -> Self {
    Self::new(200, value.to_string()).with_header("content-type", "application/json")
  }

  /// Returned when neither network, cache nor fallback could answer.
  pub fn unavailable() -> Self {
    let mut response =
      Self::new(503, "Service Unavailable").with_header("content-type", "text/plain");
    response.source = ResponseSource::Synthetic;
    response
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Anything able to put a request on the wire.
#[async_trait]
pub trait Network: Send + Sync {
  /// Perform the request. Any HTTP response (including non-2xx) is `Ok`;
  /// only transport failures are errors.
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network backed by reqwest.
/// Clone is cheap - reqwest::Client shares its connection pool.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| SyncError::ProtocolViolation(format!("Invalid method: {}", e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
      source: ResponseSource::Network,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_strips_fragment() {
    let request = Request::get("https://stories.example/index.html#top").unwrap();
    assert_eq!(request.cache_key(), "https://stories.example/index.html");
  }

  #[test]
  fn test_destination_parse() {
    assert_eq!(Destination::parse("IMAGE"), Destination::Image);
    assert_eq!(Destination::parse("unknown"), Destination::Empty);
    assert!(Destination::Font.is_static_asset());
    assert!(!Destination::Document.is_static_asset());
  }

  #[test]
  fn test_non_http_scheme() {
    let request = Request::get("chrome-extension://abc/script.js").unwrap();
    assert!(!request.is_http());
  }

  #[test]
  fn test_response_ok_range() {
    assert!(Response::new(204, "").ok());
    assert!(!Response::new(404, "").ok());
    assert!(!Response::unavailable().ok());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "{}").with_header("Content-Type", "application/json");
    assert_eq!(response.header("content-type"), Some("application/json"));
  }
}
