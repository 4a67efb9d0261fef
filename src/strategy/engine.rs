use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{classify, Route, Strategy};
use crate::cache::{CacheCatalog, CacheGeneration, PartitionKind};
use crate::config::Config;
use crate::error::Result;
use crate::fetch::{Network, Request, Response, ResponseSource};
use crate::messenger::{Message, Messenger};

/// Runs routes against the cache catalog and the network.
///
/// Clone is cheap; clones share the catalog, the network and the set of
/// outstanding background revalidations.
#[derive(Clone)]
pub struct StrategyEngine {
  catalog: Arc<dyn CacheCatalog>,
  network: Arc<dyn Network>,
  messenger: Messenger,
  config: Arc<Config>,
  generation: CacheGeneration,
  revalidations: Arc<Mutex<Vec<JoinHandle<Option<Response>>>>>,
}

impl StrategyEngine {
  pub fn new(
    catalog: Arc<dyn CacheCatalog>,
    network: Arc<dyn Network>,
    messenger: Messenger,
    config: Arc<Config>,
  ) -> Self {
    let generation = config.generation();
    Self {
      catalog,
      network,
      messenger,
      config,
      generation,
      revalidations: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Answer an intercepted request. Never fails: when nothing can answer,
  /// the result is a synthetic 503.
  pub async fn handle(&self, request: &Request) -> Response {
    match classify(request, &self.config) {
      Some(route) => self.execute(&route, request).await,
      None => {
        debug!(method = request.method.as_str(), url = %request.url, "Bypassing strategy engine");
        match self.fetch_network(request).await {
          Ok(response) => response,
          Err(_) => Response::unavailable(),
        }
      }
    }
  }

  pub async fn execute(&self, route: &Route, request: &Request) -> Response {
    debug!(
      strategy = %route.strategy,
      partition = %route.partition,
      url = %request.url,
      "Executing route"
    );
    match route.strategy {
      Strategy::CacheFirst => self.cache_first(route, request).await,
      Strategy::NetworkFirst => self.network_first(route, request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(route, request).await,
    }
  }

  /// Wait for every background revalidation started so far.
  pub async fn settle(&self) {
    loop {
      let pending = match self.revalidations.lock() {
        Ok(mut handles) => std::mem::take(&mut *handles),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
      };
      if pending.is_empty() {
        return;
      }
      for handle in pending {
        let _ = handle.await;
      }
    }
  }

  async fn cache_first(&self, route: &Route, request: &Request) -> Response {
    if let Some(hit) = self.lookup(route.partition, request) {
      debug!(url = %request.url, "Cache hit");
      return hit;
    }

    match self.fetch_network(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(route.partition, request, &response);
        }
        response
      }
      Err(_) => self.fallback(route),
    }
  }

  async fn network_first(&self, route: &Route, request: &Request) -> Response {
    match self.fetch_network(request).await {
      Ok(response) if response.ok() => {
        self.store(route.partition, request, &response);
        return response;
      }
      Ok(response) => debug!(status = response.status, url = %request.url, "Network answered with an error"),
      Err(_) => {}
    }

    if let Some(hit) = self.lookup(route.partition, request) {
      debug!(url = %request.url, "Serving cached response after network failure");
      return hit;
    }

    if route.partition == PartitionKind::Api && !self.messenger.is_online() {
      // Pages hold the stories in their durable store and can refill the cache
      self.messenger.broadcast(&Message::GetOfflineStories);
    }
    self.fallback(route)
  }

  async fn stale_while_revalidate(&self, route: &Route, request: &Request) -> Response {
    let cached = self.lookup(route.partition, request);

    let engine = self.clone();
    let partition = route.partition;
    let background = request.clone();
    let revalidation =
      tokio::spawn(async move { engine.revalidate(partition, &background).await });

    if let Some(hit) = cached {
      debug!(url = %request.url, "Serving stale response while revalidating");
      match self.revalidations.lock() {
        Ok(mut handles) => handles.push(revalidation),
        Err(poisoned) => poisoned.into_inner().push(revalidation),
      }
      return hit;
    }

    match revalidation.await {
      Ok(Some(response)) => response,
      _ => self.fallback(route),
    }
  }

  /// Fetch and store a fresh copy. Failures are swallowed.
  async fn revalidate(&self, partition: PartitionKind, request: &Request) -> Option<Response> {
    match self.fetch_network(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(partition, request, &response);
        }
        Some(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Revalidation failed");
        None
      }
    }
  }

  /// Put the request on the wire and report what it says about connectivity.
  async fn fetch_network(&self, request: &Request) -> Result<Response> {
    let outcome = self.network.fetch(request).await;
    match &outcome {
      Ok(_) => {
        self.messenger.report_connectivity(true);
      }
      Err(e) if e.is_network() => {
        self.messenger.report_connectivity(false);
      }
      Err(_) => {}
    }
    outcome
  }

  /// Designated partition first, then any partition of the catalog.
  fn lookup(&self, partition: PartitionKind, request: &Request) -> Option<Response> {
    let name = self.generation.partition_name(partition);
    let entry = match self.catalog.match_in(&name, request) {
      Ok(Some(entry)) => Some(entry),
      Ok(None) => self.catalog.match_any(request).unwrap_or_else(|e| {
        warn!(error = %e, "Cache lookup failed");
        None
      }),
      Err(e) => {
        warn!(partition = %name, error = %e, "Cache lookup failed");
        None
      }
    };
    entry.map(|entry| entry.response.with_source(ResponseSource::Cache))
  }

  fn store(&self, partition: PartitionKind, request: &Request, response: &Response) {
    let name = self.generation.partition_name(partition);
    if let Err(e) = self.catalog.put(&name, request, response) {
      warn!(partition = %name, url = %request.url, error = %e, "Failed to cache response");
    }
  }

  /// Offline document or placeholder, else a synthetic 503.
  fn fallback(&self, route: &Route) -> Response {
    let Some(path) = &route.fallback else {
      return Response::unavailable();
    };
    let request = match Request::get(&self.config.absolute(path)) {
      Ok(request) => request,
      Err(e) => {
        warn!(path = %path, error = %e, "Invalid fallback path");
        return Response::unavailable();
      }
    };
    match self.catalog.match_any(&request) {
      Ok(Some(entry)) => {
        debug!(fallback = %path, "Serving fallback");
        entry.response.with_source(ResponseSource::Fallback)
      }
      Ok(None) => Response::unavailable(),
      Err(e) => {
        warn!(error = %e, "Fallback lookup failed");
        Response::unavailable()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteCatalog;
  use crate::fetch::{Destination, Method};
  use crate::testing::{test_config, MockNetwork};

  struct Harness {
    engine: StrategyEngine,
    catalog: Arc<SqliteCatalog>,
    network: Arc<MockNetwork>,
    messenger: Messenger,
    generation: CacheGeneration,
  }

  fn harness() -> Harness {
    let config = Arc::new(test_config());
    let catalog = Arc::new(SqliteCatalog::open_in_memory().unwrap());
    let network = MockNetwork::new();
    let (messenger, _inbound) = Messenger::new();
    let engine = StrategyEngine::new(
      catalog.clone(),
      network.clone(),
      messenger.clone(),
      config.clone(),
    );
    Harness {
      engine,
      catalog,
      network,
      messenger,
      generation: config.generation(),
    }
  }

  fn seed(h: &Harness, kind: PartitionKind, url: &str, body: &str) {
    let request = Request::get(url).unwrap();
    h.catalog
      .put(
        &h.generation.partition_name(kind),
        &request,
        &Response::new(200, body),
      )
      .unwrap();
  }

  fn cached_body(h: &Harness, kind: PartitionKind, url: &str) -> Option<String> {
    let request = Request::get(url).unwrap();
    h.catalog
      .match_in(&h.generation.partition_name(kind), &request)
      .unwrap()
      .map(|entry| entry.response.text())
  }

  #[tokio::test]
  async fn test_image_failure_serves_placeholder() {
    let h = harness();
    seed(&h, PartitionKind::Offline, "http://localhost:8080/images/placeholder.png", "placeholder");
    h.network.set_offline(true);

    for url in [
      "http://localhost:8080/images/a.png",
      "https://cdn.example/photos/b.jpg",
    ] {
      let request = Request::get(url).unwrap().with_destination(Destination::Image);
      let response = h.engine.handle(&request).await;
      assert_eq!(response.status, 200);
      assert_eq!(response.text(), "placeholder");
      assert_eq!(response.source, ResponseSource::Fallback);
    }
  }

  #[tokio::test]
  async fn test_no_fallback_yields_synthetic_503() {
    let h = harness();
    h.network.set_offline(true);
    let request = Request::get("http://localhost:8080/images/a.png")
      .unwrap()
      .with_destination(Destination::Image);

    let response = h.engine.handle(&request).await;
    assert_eq!(response.status, 503);
    assert_eq!(response.source, ResponseSource::Synthetic);
  }

  #[tokio::test]
  async fn test_cache_first_stores_before_returning() {
    let h = harness();
    h.network.respond("http://localhost:8080/styles/styles.css", 200, "body{}");
    let request = Request::get("http://localhost:8080/styles/styles.css")
      .unwrap()
      .with_destination(Destination::Style);

    let first = h.engine.handle(&request).await;
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(
      cached_body(&h, PartitionKind::Runtime, "http://localhost:8080/styles/styles.css").as_deref(),
      Some("body{}")
    );

    let second = h.engine.handle(&request).await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(h.network.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let h = harness();
    let request = Request::get("http://localhost:8080/scripts/missing.js")
      .unwrap()
      .with_destination(Destination::Script);

    let response = h.engine.handle(&request).await;
    assert_eq!(response.status, 404);
    assert!(cached_body(&h, PartitionKind::Runtime, "http://localhost:8080/scripts/missing.js").is_none());
  }

  #[tokio::test]
  async fn test_cache_first_finds_entry_in_other_partition() {
    let h = harness();
    seed(&h, PartitionKind::Core, "http://localhost:8080/scripts/index.js", "core-js");
    let request = Request::get("http://localhost:8080/scripts/index.js")
      .unwrap()
      .with_destination(Destination::Script);

    let response = h.engine.handle(&request).await;
    assert_eq!(response.text(), "core-js");
    assert!(h.network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let h = harness();
    let url = "http://localhost:8080/api/stories";
    h.network.respond(url, 200, r#"{"listStory":[]}"#);
    let request = Request::get(url).unwrap();

    let online = h.engine.handle(&request).await;
    assert_eq!(online.source, ResponseSource::Network);

    h.network.set_offline(true);
    let offline = h.engine.handle(&request).await;
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.text(), r#"{"listStory":[]}"#);
  }

  #[tokio::test]
  async fn test_api_miss_offline_asks_pages_for_stories() {
    let h = harness();
    let mut page = h.messenger.connect("http://localhost:8080/");
    h.network.set_offline(true);

    let response = h
      .engine
      .handle(&Request::get("http://localhost:8080/api/stories").unwrap())
      .await;
    assert_eq!(response.status, 503);

    let mut received = Vec::new();
    while let Some(message) = page.try_recv() {
      received.push(message);
    }
    assert!(received.contains(&Message::GetOfflineStories));
    assert!(received
      .iter()
      .any(|m| matches!(m, Message::NetworkStatus(status) if !status.is_online)));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_converges() {
    let h = harness();
    let url = "https://tiles.example/7/64/42.png";
    seed(&h, PartitionKind::Runtime, url, "v1");
    h.network.respond(url, 200, "v2");
    let request = Request::get(url).unwrap();

    let first = h.engine.handle(&request).await;
    assert_eq!(first.text(), "v1");
    assert_eq!(first.source, ResponseSource::Cache);
    h.engine.settle().await;
    assert_eq!(cached_body(&h, PartitionKind::Runtime, url).as_deref(), Some("v2"));

    h.network.respond(url, 200, "v3");
    let second = h.engine.handle(&request).await;
    assert_eq!(second.text(), "v2");
    h.engine.settle().await;
    assert_eq!(cached_body(&h, PartitionKind::Runtime, url).as_deref(), Some("v3"));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_awaits_network() {
    let h = harness();
    let url = "https://tiles.example/1/1/1.png";
    h.network.respond(url, 200, "tile");

    let response = h.engine.handle(&Request::get(url).unwrap()).await;
    assert_eq!(response.text(), "tile");
    assert_eq!(response.source, ResponseSource::Network);
  }

  #[tokio::test]
  async fn test_non_get_goes_straight_to_network() {
    let h = harness();
    let url = "http://localhost:8080/api/stories";
    h.network.respond(url, 201, "created");
    let request = Request::new(Method::Post, url).unwrap();

    let response = h.engine.handle(&request).await;
    assert_eq!(response.status, 201);
    assert!(cached_body(&h, PartitionKind::Api, url).is_none());
  }
}
