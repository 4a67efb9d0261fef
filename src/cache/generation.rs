//! Versioned partition naming.

use std::fmt;

/// The named partitions every generation owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  /// App shell and static assets declared in the manifest
  Core,
  /// Anything cached while serving requests
  Runtime,
  /// API responses
  Api,
  /// The home document, kept apart from the runtime partition
  Home,
  /// Offline document and placeholder assets
  Offline,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 5] = [
    PartitionKind::Core,
    PartitionKind::Runtime,
    PartitionKind::Api,
    PartitionKind::Home,
    PartitionKind::Offline,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Core => "core",
      Self::Runtime => "runtime",
      Self::Api => "api",
      Self::Home => "home",
      Self::Offline => "offline",
    }
  }
}

impl fmt::Display for PartitionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One version epoch of the cache catalog.
///
/// Partition names embed the version tag, so bumping the version yields a
/// disjoint whitelist and activation can purge every older partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  prefix: String,
  version: String,
}

impl CacheGeneration {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn partition_name(&self, kind: PartitionKind) -> String {
    format!("{}-{}-v{}", self.prefix, kind, self.version)
  }

  /// Every partition name that may live on disk under this generation.
  pub fn whitelist(&self) -> Vec<String> {
    PartitionKind::ALL
      .iter()
      .map(|kind| self.partition_name(*kind))
      .collect()
  }

  pub fn is_whitelisted(&self, name: &str) -> bool {
    PartitionKind::ALL
      .iter()
      .any(|kind| self.partition_name(*kind) == name)
  }
}
