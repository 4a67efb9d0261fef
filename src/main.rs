mod cache;
mod config;
mod db;
mod error;
mod event;
mod fetch;
mod lifecycle;
mod messenger;
mod page;
mod push;
mod remote;
mod strategy;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::{CacheCatalog, SqliteCatalog};
use crate::config::Config;
use crate::db::Database;
use crate::event::{EventHandler, WorkerEvent};
use crate::lifecycle::LifecycleEvent;
use crate::fetch::{Destination, HttpNetwork, Method, Request};
use crate::messenger::Messenger;
use crate::page::{PageContext, SubmitOutcome};
use crate::push::PushData;
use crate::remote::{NewStory, RemoteAuthority, StoryApiClient};
use crate::worker::{Worker, WorkerReply};

#[derive(Parser, Debug)]
#[command(name = "storysync")]
#[command(about = "Offline-first sync worker for a story sharing app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storysync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the page as offline: story actions are queued instead of sent
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install and activate the configured cache generation
  Install,
  /// Answer a request through the strategy engine
  Fetch {
    url: String,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Request destination (document, style, script, font, image...)
    #[arg(long, default_value = "")]
    destination: String,
  },
  #[command(subcommand)]
  Story(StoryCommand),
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Replay pending writes now
  Sync,
  /// Refresh the stored story list
  Refresh,
  /// List cache partitions
  Partitions,
  /// Deliver a push message
  Push {
    /// Raw push data (JSON)
    #[arg(long)]
    data: Option<String>,
  },
  /// Click a notification targeting the given URL
  Click { url: String },
  /// Keep the worker running, refreshing periodically
  Watch {
    /// Seconds between refreshes
    #[arg(long, default_value_t = 60)]
    interval: u64,
  },
}

#[derive(Subcommand, Debug)]
enum StoryCommand {
  /// Show stored stories
  List,
  /// Publish a story, queueing it when offline
  Add {
    #[arg(short, long)]
    description: String,
    /// Photo as a data URL
    #[arg(long)]
    photo: Option<String>,
    #[arg(long, requires = "lon")]
    lat: Option<f64>,
    #[arg(long, requires = "lat")]
    lon: Option<f64>,
  },
  /// Delete a story, queueing it when offline
  Delete { id: String },
  /// Show one story from the server
  Show { id: String },
  Like { id: String },
  Comment { id: String, text: String },
  /// Subscribe to notifications about a story
  Subscribe { id: String },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Show queued writes
  List {
    /// Only writes that reached the retry ceiling
    #[arg(long)]
    failed: bool,
  },
  /// Give a failed write another round of attempts
  Retry { local_id: i64 },
  /// Drop a queued write
  Discard { local_id: i64 },
}

fn init_tracing(data_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::never(data_dir, "storysync.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(fmt::layer().with_writer(std::io::stderr.with_max_level(Level::WARN)))
    .init();

  Ok(guard)
}

/// Let the page and the worker answer each other until both are idle.
async fn settle(worker: &Worker, page: &mut PageContext, events: &mut EventHandler) -> Result<()> {
  loop {
    let handled = page.pump()? + worker.drain(events).await;
    if handled == 0 {
      return Ok(());
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Arc::new(Config::load(args.config.as_deref())?);
  let data_dir = config.data_dir()?;
  let _guard = init_tracing(&data_dir)?;

  let timeout = Duration::from_secs(config.request_timeout_secs);
  let catalog: Arc<dyn CacheCatalog> = Arc::new(SqliteCatalog::open(&data_dir.join("cache.db"))?);
  let db = Arc::new(Database::open(&data_dir.join("stories.db"))?);
  debug!(schema = db.schema_version()?, "Durable store opened");
  let network = Arc::new(HttpNetwork::new(timeout)?);
  let remote = Arc::new(StoryApiClient::new(
    &config.api_base_url(),
    timeout,
    Config::get_api_token(),
  )?);

  let (messenger, inbound) = Messenger::new();
  let (mut events, external) = EventHandler::new(inbound);
  let worker = Arc::new(Worker::new(
    config.clone(),
    catalog.clone(),
    db.clone(),
    network,
    remote.clone(),
    messenger.clone(),
  ));
  worker.lifecycle().add_listener(Box::new(|event: &LifecycleEvent| {
    if let LifecycleEvent::UpdateInstalled { version } = event {
      println!("Version {} installed, reload open pages to use it", version);
    }
  }));
  let mut page = PageContext::new(messenger.connect(&config.absolute("/")), db.clone(), remote.clone());
  let online = !args.offline;

  match args.command {
    Command::Install => {
      worker.dispatch(WorkerEvent::Install).await?;
      worker.dispatch(WorkerEvent::Activate).await?;
      println!(
        "Generation {} {}, partitions: {}",
        worker.lifecycle().generation().version(),
        worker.lifecycle().state(),
        catalog.keys()?.join(", ")
      );
    }
    Command::Fetch {
      url,
      method,
      destination,
    } => {
      let method = Method::parse(&method).ok_or_else(|| eyre!("Unknown method '{}'", method))?;
      let request = Request::new(method, &url)?.with_destination(Destination::parse(&destination));
      if let WorkerReply::Response(response) = worker.dispatch(WorkerEvent::Fetch(request)).await? {
        println!(
          "{} ({:?}, {} bytes, {})",
          response.status,
          response.source,
          response.body.len(),
          response.header("content-type").unwrap_or("no content type")
        );
      }
    }
    Command::Story(StoryCommand::List) => {
      page.load_stories(online).await?;
      for record in page.stories() {
        let flag = match (record.is_offline, record.is_pending) {
          (true, _) => " [offline]",
          (false, true) => " [pending]",
          _ => "",
        };
        println!("{}{}  {}: {}", record.id(), flag, record.story.name, record.story.description);
      }
    }
    Command::Story(StoryCommand::Add {
      description,
      photo,
      lat,
      lon,
    }) => {
      let story = NewStory {
        description,
        photo,
        lat,
        lon,
      };
      match page.submit_story(story, online).await? {
        SubmitOutcome::Published(Some(story)) => println!("Published {}", story.id),
        SubmitOutcome::Published(None) => println!("Published"),
        SubmitOutcome::Queued(record) => println!("Saved offline as {}", record.id()),
      }
    }
    Command::Story(StoryCommand::Delete { id }) => {
      let outcome = page.delete_story(&id, online).await?;
      println!("{:?}", outcome);
    }
    Command::Story(StoryCommand::Show { id }) => {
      let story = remote.get_story(&id).await?;
      println!("{}  {}: {}", story.id, story.name, story.description);
      if let Some(photo) = &story.photo_url {
        println!("  photo: {}", photo);
      }
    }
    Command::Story(StoryCommand::Like { id }) => {
      remote.like_story(&id).await?;
      println!("Liked {}", id);
    }
    Command::Story(StoryCommand::Comment { id, text }) => {
      remote.comment_story(&id, &text).await?;
      println!("Commented on {}", id);
    }
    Command::Story(StoryCommand::Subscribe { id }) => {
      remote.subscribe_story(&id).await?;
      println!("Subscribed to {}", id);
    }
    Command::Queue(QueueCommand::List { failed }) => {
      let writes = if failed {
        db.failed_writes()?
      } else {
        db.all_writes()?
      };
      for write in writes {
        println!(
          "#{} {} {} [{}] queued={} retries={}{}",
          write.local_id,
          write.kind.as_str(),
          write.story_id,
          write.status,
          write.created_at.format("%Y-%m-%d %H:%M"),
          write.retry_count,
          write
            .last_error
            .map(|e| format!(" last_error={}", e))
            .unwrap_or_default()
        );
      }
    }
    Command::Queue(QueueCommand::Retry { local_id }) => {
      if !db.retry(local_id)? {
        return Err(eyre!("No failed write #{}", local_id));
      }
      println!("Write #{} queued again", local_id);
    }
    Command::Queue(QueueCommand::Discard { local_id }) => {
      let write = db
        .get_pending(local_id)?
        .ok_or_else(|| eyre!("No queued write #{}", local_id))?;
      db.discard(local_id)?;
      println!("Write #{} ({} {}) discarded", local_id, write.kind.as_str(), write.story_id);
    }
    Command::Sync => {
      let tag = config.sync.tag.clone();
      match worker.dispatch(WorkerEvent::Sync(tag)).await? {
        WorkerReply::Synced(Some(summary)) => {
          println!("{} synced, {} failed", summary.succeeded, summary.failed)
        }
        _ => println!("A sync pass is already running"),
      }
    }
    Command::Refresh => {
      let tag = config.sync.periodic_tag.clone();
      if let WorkerReply::Refreshed(count) = worker.dispatch(WorkerEvent::Sync(tag)).await? {
        println!("{} stories stored", count);
      }
    }
    Command::Partitions => {
      let generation = config.generation();
      let keys = catalog.keys()?;
      for name in &keys {
        let marker = if generation.is_whitelisted(name) { "" } else { " (stale)" };
        println!("{} {} entries{}", name, catalog.entries(name)?.len(), marker);
      }
      for name in generation.whitelist() {
        if !keys.contains(&name) {
          println!("{} (not opened)", name);
        }
      }
    }
    Command::Push { data } => {
      let event = WorkerEvent::Push(data.map(String::into_bytes));
      if let WorkerReply::Push(outcome) = worker.dispatch(event).await? {
        match outcome.shown {
          Some(notification) => println!("Notification: {} - {}", notification.title, notification.body),
          None => println!("Forwarded to {} page(s)", outcome.forwarded_to),
        }
      }
    }
    Command::Click { url } => {
      let event = WorkerEvent::NotificationClick(PushData { url, story_id: None });
      if let WorkerReply::Click(action) = worker.dispatch(event).await? {
        println!("{:?}", action);
      }
    }
    Command::Watch { interval } => {
      let watcher = worker.watch_connectivity();
      let runner = tokio::spawn(worker.clone().run(events));
      let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
      info!(interval, "Worker running");
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            let tag = config.sync.periodic_tag.clone();
            if external.send(WorkerEvent::Sync(tag)).is_err() {
              warn!("Worker event loop stopped");
              break;
            }
          }
          handled = page.next_message() => {
            if !handled? {
              break;
            }
            let status = if page.is_online() { "online" } else { "offline" };
            for toast in page.take_toasts() {
              println!("[{}] {}", status, toast);
            }
          }
          _ = tokio::signal::ctrl_c() => break,
        }
      }
      watcher.abort();
      runner.abort();
      return Ok(());
    }
  }

  settle(&worker, &mut page, &mut events).await?;
  for toast in page.take_toasts() {
    println!("{}", toast);
  }

  Ok(())
}
