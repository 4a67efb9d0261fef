use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{CacheGeneration, PartitionKind};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the worker is registered for (scheme + host + port)
  pub origin: String,
  /// Path prefix identifying API requests
  pub api_prefix: String,
  /// Base URL of the remote authority (defaults to `<origin>/api`)
  pub api_base_url: Option<String>,
  /// Application version tag; part of every partition name
  pub app_version: String,
  /// Prefix for partition names
  pub cache_prefix: String,
  /// Document served when a navigation cannot be answered
  pub offline_document: String,
  /// Image served when an image cannot be answered
  pub placeholder_image: String,
  pub manifest: ManifestConfig,
  pub sync: SyncConfig,
  /// Timeout for every network request, in seconds
  pub request_timeout_secs: u64,
  /// Where the cache catalog, the durable store and logs live
  pub data_dir: Option<PathBuf>,
}

/// Paths pre-cached into each partition at install time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
  pub core: Vec<String>,
  pub home: Vec<String>,
  pub offline: Vec<String>,
  pub runtime: Vec<String>,
  pub api: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background sync tag that drains the pending-write queue
  pub tag: String,
  /// Periodic sync tag that refreshes the story list
  pub periodic_tag: String,
  /// Failed attempts after which a pending write is marked failed
  pub retry_ceiling: u32,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      api_prefix: "/api/".to_string(),
      api_base_url: None,
      app_version: "1.0.0".to_string(),
      cache_prefix: "story-app".to_string(),
      offline_document: "/offline.html".to_string(),
      placeholder_image: "/images/placeholder.png".to_string(),
      manifest: ManifestConfig::default(),
      sync: SyncConfig::default(),
      request_timeout_secs: 30,
      data_dir: None,
    }
  }
}

impl Default for ManifestConfig {
  fn default() -> Self {
    let paths = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    Self {
      core: paths(&[
        "/index.html",
        "/styles/styles.css",
        "/scripts/index.js",
        "/images/icon-192x192.png",
        "/images/icon-512x512.png",
        "/images/default-avatar.png",
        "/images/logo.png",
        "/favicon.png",
      ]),
      home: paths(&["/"]),
      offline: paths(&["/offline.html", "/offline.css", "/images/placeholder.png"]),
      runtime: Vec::new(),
      api: Vec::new(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-stories".to_string(),
      periodic_tag: "update-stories".to_string(),
      retry_ceiling: 5,
    }
  }
}

impl ManifestConfig {
  /// Manifest entries for one partition.
  pub fn paths(&self, kind: PartitionKind) -> &[String] {
    match kind {
      PartitionKind::Core => &self.core,
      PartitionKind::Runtime => &self.runtime,
      PartitionKind::Api => &self.api,
      PartitionKind::Home => &self.home,
      PartitionKind::Offline => &self.offline,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storysync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storysync/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("storysync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storysync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/': {}", self.api_prefix));
    }
    if self.sync.retry_ceiling == 0 {
      return Err(eyre!("sync.retry_ceiling must be at least 1"));
    }
    Ok(())
  }

  /// Base URL of the remote authority, without a trailing slash.
  pub fn api_base_url(&self) -> String {
    match &self.api_base_url {
      Some(url) => url.trim_end_matches('/').to_string(),
      None => format!(
        "{}{}",
        self.origin.trim_end_matches('/'),
        self.api_prefix.trim_end_matches('/')
      ),
    }
  }

  /// Cache generation for the configured version tag.
  pub fn generation(&self) -> CacheGeneration {
    CacheGeneration::new(&self.cache_prefix, &self.app_version)
  }

  /// Canonical endpoint for the story list.
  pub fn stories_endpoint(&self) -> String {
    format!("{}/stories", self.api_base_url())
  }

  /// Endpoint for a single story.
  pub fn story_endpoint(&self, story_id: &str) -> String {
    format!("{}/stories/{}", self.api_base_url(), story_id)
  }

  /// Resolve a site-relative path against the origin.
  pub fn absolute(&self, path: &str) -> String {
    format!("{}{}", self.origin.trim_end_matches('/'), path)
  }

  /// Directory for the cache catalog, durable store and log file.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("storysync"))
  }

  /// Get the remote API token from the environment, if any.
  pub fn get_api_token() -> Option<String> {
    std::env::var("STORYSYNC_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.stories_endpoint(), "http://localhost:8080/api/stories");
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "origin: https://stories.example\napp_version: 2.1.0\nsync:\n  retry_ceiling: 3\n",
    )
    .unwrap();
    assert_eq!(config.app_version, "2.1.0");
    assert_eq!(config.sync.retry_ceiling, 3);
    assert_eq!(config.sync.tag, "sync-stories");
    assert_eq!(config.manifest.home, vec!["/".to_string()]);
    assert_eq!(config.story_endpoint("s1"), "https://stories.example/api/stories/s1");
  }

  #[test]
  fn test_explicit_api_base_url() {
    let config = Config::from_yaml("api_base_url: https://api.example/v1/\n").unwrap();
    assert_eq!(config.stories_endpoint(), "https://api.example/v1/stories");
  }

  #[test]
  fn test_zero_retry_ceiling_rejected() {
    let config = Config::from_yaml("sync:\n  retry_ceiling: 0\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    assert!(Config::load(Some(Path::new("/nonexistent/storysync.yaml"))).is_err());
  }
}
