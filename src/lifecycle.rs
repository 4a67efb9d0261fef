//! Install and activation of a cache generation.

use futures::future::join_all;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::{CacheCatalog, CacheGeneration, PartitionKind};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::fetch::{Network, Request, Response};
use crate::messenger::Messenger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Waiting,
  Activating,
  Active,
  Redundant,
}

impl LifecycleState {
  pub fn can_transition_to(&self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (Installing, Waiting)
        | (Installing, Redundant)
        | (Waiting, Activating)
        | (Activating, Active)
        | (Activating, Redundant)
        | (Active, Redundant)
    )
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
  StateChange {
    from: LifecycleState,
    to: LifecycleState,
  },
  /// A new generation finished installing; pages may offer to reload
  UpdateInstalled { version: String },
  /// The worker took control of the open pages
  ControllerChange { clients: usize },
}

pub type LifecycleListener = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Drives one worker generation from install to activation.
pub struct LifecycleManager {
  state: Mutex<LifecycleState>,
  listeners: Mutex<Vec<LifecycleListener>>,
  catalog: Arc<dyn CacheCatalog>,
  network: Arc<dyn Network>,
  messenger: Messenger,
  config: Arc<Config>,
  generation: CacheGeneration,
}

impl LifecycleManager {
  pub fn new(
    catalog: Arc<dyn CacheCatalog>,
    network: Arc<dyn Network>,
    messenger: Messenger,
    config: Arc<Config>,
  ) -> Self {
    let generation = config.generation();
    Self {
      state: Mutex::new(LifecycleState::Installing),
      listeners: Mutex::new(Vec::new()),
      catalog,
      network,
      messenger,
      config,
      generation,
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state_lock()
  }

  pub fn generation(&self) -> &CacheGeneration {
    &self.generation
  }

  pub fn add_listener(&self, listener: LifecycleListener) {
    self
      .listeners
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push(listener);
  }

  fn state_lock(&self) -> MutexGuard<'_, LifecycleState> {
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn emit(&self, event: LifecycleEvent) {
    let listeners = self
      .listeners
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    for listener in listeners.iter() {
      listener(&event);
    }
  }

  fn transition(&self, to: LifecycleState) -> Result<()> {
    let from = {
      let mut state = self.state_lock();
      let from = *state;
      if !from.can_transition_to(to) {
        return Err(SyncError::ProtocolViolation(format!(
          "Invalid lifecycle transition {} -> {}",
          from, to
        )));
      }
      *state = to;
      from
    };
    info!(%from, %to, version = self.generation.version(), "Lifecycle transition");
    self.emit(LifecycleEvent::StateChange { from, to });
    Ok(())
  }

  /// Pre-cache every manifest entry. Nothing is written unless every entry
  /// could be fetched; a failed install leaves the worker redundant.
  pub async fn install(&self) -> Result<()> {
    let fetched = match self.fetch_manifest().await {
      Ok(fetched) => fetched,
      Err(e) => {
        warn!(error = %e, "Install failed");
        self.transition(LifecycleState::Redundant)?;
        return Err(e);
      }
    };

    for (kind, entries) in fetched {
      let name = self.generation.partition_name(kind);
      let written = self
        .catalog
        .open(&name)
        .and_then(|_| self.catalog.put_all(&name, &entries));
      if let Err(e) = written {
        warn!(partition = %name, error = %e, "Install failed");
        self.transition(LifecycleState::Redundant)?;
        return Err(e);
      }
      debug!(partition = %name, entries = entries.len(), "Partition pre-cached");
    }

    self.transition(LifecycleState::Waiting)?;
    self.emit(LifecycleEvent::UpdateInstalled {
      version: self.generation.version().to_string(),
    });
    Ok(())
  }

  async fn fetch_manifest(&self) -> Result<Vec<(PartitionKind, Vec<(Request, Response)>)>> {
    let mut fetched = Vec::new();
    for kind in PartitionKind::ALL {
      let requests = self
        .config
        .manifest
        .paths(kind)
        .iter()
        .map(|path| Request::get(&self.config.absolute(path)))
        .collect::<Result<Vec<_>>>()?;

      let responses = join_all(requests.iter().map(|r| self.network.fetch(r))).await;

      let mut entries = Vec::with_capacity(requests.len());
      for (request, response) in requests.into_iter().zip(responses) {
        let response = response?;
        if !response.ok() {
          return Err(SyncError::CacheFailure(format!(
            "Manifest entry {} answered {}",
            request.url, response.status
          )));
        }
        entries.push((request, response));
      }
      fetched.push((kind, entries));
    }
    Ok(fetched)
  }

  /// Purge every partition outside this generation and take control of the
  /// open pages.
  pub async fn activate(&self) -> Result<()> {
    self.transition(LifecycleState::Activating)?;

    if let Err(e) = self.purge_stale_partitions() {
      warn!(error = %e, "Activation failed");
      self.transition(LifecycleState::Redundant)?;
      return Err(e);
    }

    let clients = self.messenger.claim();
    self.emit(LifecycleEvent::ControllerChange { clients });
    self.transition(LifecycleState::Active)
  }

  fn purge_stale_partitions(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.catalog.keys()? {
      if self.generation.is_whitelisted(&name) {
        continue;
      }
      self.catalog.delete(&name)?;
      info!(partition = %name, "Deleted stale partition");
      deleted.push(name);
    }
    Ok(deleted)
  }
}
