//! Strategy engine: decides how each intercepted request is answered.
//!
//! `classify` maps a request onto a `Route`, `StrategyEngine::execute` runs
//! that route against the cache catalog and the network.

mod engine;

pub use engine::StrategyEngine;

use std::fmt;
use url::Url;

use crate::cache::PartitionKind;
use crate::config::Config;
use crate::fetch::{Destination, Method, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
    };
    f.write_str(name)
  }
}

/// How one request is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub strategy: Strategy,
  /// Partition responses are read from and written to
  pub partition: PartitionKind,
  /// Site-relative path served when nothing else can answer
  pub fallback: Option<String>,
}

impl Route {
  fn new(strategy: Strategy, partition: PartitionKind, fallback: &str) -> Self {
    Self {
      strategy,
      partition,
      fallback: Some(fallback.to_string()),
    }
  }
}

/// Whether the request targets the remote authority.
fn is_api_request(request: &Request, config: &Config, same_origin: bool) -> bool {
  if same_origin && request.url.path().starts_with(&config.api_prefix) {
    return true;
  }
  let base = config.api_base_url();
  let key = request.cache_key();
  key == base || key.starts_with(&format!("{}/", base))
}

/// Pick a route for a request. `None` means the request bypasses the engine
/// (anything but GET, or a non-http(s) scheme).
pub fn classify(request: &Request, config: &Config) -> Option<Route> {
  if request.method != Method::Get || !request.is_http() {
    return None;
  }

  let same_origin = Url::parse(&config.origin)
    .map(|origin| origin.origin().ascii_serialization() == request.origin())
    .unwrap_or(false);

  if is_api_request(request, config, same_origin) {
    return Some(Route::new(
      Strategy::NetworkFirst,
      PartitionKind::Api,
      &config.offline_document,
    ));
  }

  if request.destination.is_static_asset() {
    let fallback = if request.destination == Destination::Image {
      &config.placeholder_image
    } else {
      &config.offline_document
    };
    return Some(Route::new(Strategy::CacheFirst, PartitionKind::Runtime, fallback));
  }

  let path = request.url.path();
  if same_origin && (path == "/" || path == "/index.html") {
    return Some(Route::new(
      Strategy::CacheFirst,
      PartitionKind::Home,
      &config.offline_document,
    ));
  }

  if !same_origin {
    return Some(Route::new(
      Strategy::StaleWhileRevalidate,
      PartitionKind::Runtime,
      &config.offline_document,
    ));
  }

  Some(Route::new(
    Strategy::NetworkFirst,
    PartitionKind::Runtime,
    &config.offline_document,
  ))
}
