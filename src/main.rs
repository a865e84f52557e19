use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netcache::cache::{CacheSource, SqliteStorage};
use netcache::clock::{Clock, SystemClock};
use netcache::db::Database;
use netcache::http::Request;
use netcache::network::{spawn_probe, Fetcher, HttpFetcher, NoopSigner, RequestSigner};
use netcache::offline::{
  HttpMutationHandler, JsonFileRepository, MutationEnvelope, MutationStatus, QueueRepository,
  ReplayResult, SqliteQueueRepository,
};
use netcache::{
  CacheStrategyEngine, Config, NetworkStatusMonitor, OfflineClient, OfflineMutationQueue,
  WriteOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "netcache")]
#[command(about = "Caching HTTP client with offline write replay")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./netcache.yaml, then $XDG_CONFIG_HOME/netcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long, global = true, value_name = "DIR")]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch an origin-relative path through the cache
  Fetch {
    path: String,
    /// Ask for an HTML document (routes to the pages store)
    #[arg(long)]
    document: bool,
  },
  /// Send a write; queued for later if the network is unreachable
  Send {
    method: String,
    path: String,
    #[arg(short, long)]
    body: Option<String>,
    /// Label recorded with the queued mutation (default: "<METHOD> <path>")
    #[arg(short, long)]
    action: Option<String>,
  },
  /// Queue a write without attempting it
  Enqueue {
    method: String,
    path: String,
    #[arg(short, long)]
    body: Option<String>,
    #[arg(short, long)]
    action: Option<String>,
  },
  /// Replay queued writes now
  Replay,
  /// Show queue counts
  Status,
  /// List queued writes
  List,
  /// Pre-warm the critical static paths
  Install,
  /// Delete outdated cache generations
  Activate,
  /// Drop a queued write
  Discard { id: u64 },
  /// Put failed writes back in line (all of them without an id)
  Retry { id: Option<u64> },
  /// Probe connectivity until Ctrl-C, replaying on reconnect
  Watch,
}

type Client = OfflineClient<SqliteStorage, Box<dyn QueueRepository>>;

struct App {
  config: Config,
  client: Client,
  monitor: Arc<NetworkStatusMonitor>,
  fetcher: Arc<dyn Fetcher>,
}

impl App {
  fn new(config: Config, initially_online: bool) -> Result<Self> {
    let db = Arc::new(Database::open_at(&config.database_path()?)?);
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));

    let repository: Box<dyn QueueRepository> = match &config.queue.path {
      Some(path) => Box::new(JsonFileRepository::new(path.clone())),
      None => Box::new(SqliteQueueRepository::new(db)),
    };

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(Duration::from_secs(
      config.network.timeout_secs,
    ))?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let signer: Arc<dyn RequestSigner> = Arc::new(NoopSigner);
    let monitor = Arc::new(NetworkStatusMonitor::new(initially_online));

    let engine =
      CacheStrategyEngine::new(&config, storage, Arc::clone(&fetcher), Arc::clone(&clock))?;
    let handler = HttpMutationHandler::new(Arc::clone(&fetcher), Arc::clone(&signer));
    let queue = OfflineMutationQueue::open(repository, Arc::new(handler), clock)
      .with_policy(config.queue.policy)
      .with_connectivity(monitor.subscribe());

    let client = OfflineClient::new(
      Arc::new(engine),
      Arc::new(queue),
      Arc::clone(&monitor),
      Arc::clone(&fetcher),
      signer,
    );

    Ok(Self {
      config,
      client,
      monitor,
      fetcher,
    })
  }

  fn write_request(&self, method: &str, path: &str, body: Option<String>) -> Result<Request> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method {:?}: {}", method, e))?;
    let mut request = Request::new(method, self.config.resolve(path)?);
    if let Some(body) = body {
      request = request
        .with_header("content-type", "application/json")
        .with_body(body);
    }
    Ok(request)
  }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  // RUST_LOG controls the level (e.g. RUST_LOG=netcache=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_dir {
    Some(dir) => {
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "netcache.log"));
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      None
    }
  }
}

fn status_label(status: MutationStatus) -> &'static str {
  match status {
    MutationStatus::Pending => "pending",
    MutationStatus::Syncing => "syncing",
    MutationStatus::Synced => "synced",
    MutationStatus::Failed => "failed",
  }
}

fn source_label(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "network",
    CacheSource::Cache => "cache",
    CacheSource::StaleFallback => "stale cache",
    CacheSource::OfflinePlaceholder => "offline placeholder",
    CacheSource::Passthrough => "network (not cached)",
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_dir.as_deref());

  let config = Config::load(args.config.as_deref())?;

  // The watcher learns the real state from its first probe
  let initially_online = !matches!(args.command, Command::Watch);
  let app = App::new(config, initially_online)?;

  match args.command {
    Command::Fetch { path, document } => fetch(&app, &path, document).await,
    Command::Send {
      method,
      path,
      body,
      action,
    } => {
      let request = app.write_request(&method, &path, body)?;
      let action = action.unwrap_or_else(|| format!("{} {}", request.method, path));

      match app.client.send(&action, request).await {
        Ok(WriteOutcome::Sent(response)) => {
          eprintln!("{}", response.status);
          io::stdout().write_all(&response.body)?;
          if response.is_success() {
            Ok(())
          } else {
            Err(eyre!("Server rejected the write with status {}", response.status))
          }
        }
        Ok(WriteOutcome::Queued(mutation)) => {
          println!("Saved offline, pending sync (id {})", mutation.id);
          Ok(())
        }
        Err(e) => Err(eyre!("Send failed: {}", e)),
      }
    }
    Command::Enqueue {
      method,
      path,
      body,
      action,
    } => {
      let request = app.write_request(&method, &path, body)?;
      let action = action.unwrap_or_else(|| format!("{} {}", request.method, path));
      let envelope = MutationEnvelope::from_request(&request)
        .map_err(|e| eyre!("Failed to queue write: {}", e))?;

      let mutation = app.client.queue().enqueue(&action, envelope.to_value());
      println!("Queued {} (id {})", mutation.action, mutation.id);
      Ok(())
    }
    Command::Replay => {
      let outcomes = app.client.replay_all().await;
      if outcomes.is_empty() {
        println!("Nothing to replay");
      }
      for outcome in &outcomes {
        match &outcome.result {
          ReplayResult::Synced => println!("{:>4}  synced   {}", outcome.id, outcome.action),
          ReplayResult::Failed(reason) => {
            println!("{:>4}  failed   {}: {}", outcome.id, outcome.action, reason)
          }
          ReplayResult::Offline(reason) => {
            println!("{:>4}  offline  {}: {}", outcome.id, outcome.action, reason)
          }
          ReplayResult::Skipped => println!("{:>4}  skipped  {}", outcome.id, outcome.action),
        }
      }
      Ok(())
    }
    Command::Status => {
      let summary = app.client.status();
      println!(
        "{} queued: {} pending, {} syncing, {} failed",
        summary.total(),
        summary.pending,
        summary.syncing,
        summary.failed
      );
      Ok(())
    }
    Command::List => {
      for mutation in app.client.queue().list() {
        println!(
          "{:>4}  {:<8} {}  {}  attempts={}{}",
          mutation.id,
          status_label(mutation.status),
          mutation.created_at.format("%Y-%m-%d %H:%M:%S"),
          mutation.action,
          mutation.attempts,
          mutation
            .last_error
            .map(|e| format!("  ({})", e))
            .unwrap_or_default()
        );
      }
      Ok(())
    }
    Command::Install => {
      let count = app.client.engine().install().await?;
      println!("Precached {} paths", count);
      Ok(())
    }
    Command::Activate => {
      let deleted = app.client.engine().activate()?;
      if deleted.is_empty() {
        println!("No outdated stores");
      }
      for name in deleted {
        println!("Deleted {}", name);
      }
      Ok(())
    }
    Command::Discard { id } => {
      if app.client.queue().discard(id) {
        println!("Discarded {}", id);
        Ok(())
      } else {
        Err(eyre!("No queued write with id {}", id))
      }
    }
    Command::Retry { id: Some(id) } => {
      if app.client.queue().retry(id) {
        println!("Requeued {}", id);
        Ok(())
      } else {
        Err(eyre!("No failed write with id {}", id))
      }
    }
    Command::Retry { id: None } => {
      println!("Requeued {}", app.client.queue().retry_failed());
      Ok(())
    }
    Command::Watch => watch(&app).await,
  }
}

async fn fetch(app: &App, path: &str, document: bool) -> Result<()> {
  let engine = app.client.engine();
  engine.activate()?;

  let mut request = Request::get(app.config.resolve(path)?);
  if document {
    request = request.with_header("accept", "text/html");
  }
  info!(class = ?engine.classify(&request), url = %request.url, "fetching");

  let served = app
    .client
    .get(request)
    .await
    .map_err(|e| eyre!("Fetch failed: {}", e))?;

  eprintln!("{} ({})", served.response.status, source_label(served.source));
  io::stdout().write_all(&served.response.body)?;

  // Let a background refresh land before exiting
  if let Some(revalidation) = served.revalidation {
    revalidation.settled().await;
  }
  Ok(())
}

async fn watch(app: &App) -> Result<()> {
  let url = app.config.resolve(&app.config.network.probe_path)?;
  let every = Duration::from_secs(app.config.network.probe_interval_secs.max(1));

  app.monitor.on_change(|online| {
    eprintln!("{}", if online { "online" } else { "offline" });
  });

  let probe = spawn_probe(
    Arc::clone(&app.monitor),
    Arc::clone(&app.fetcher),
    url.clone(),
    every,
  );
  info!(url = %url, every_secs = every.as_secs(), "watching connectivity");

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
  probe.abort();

  let summary = app.client.status();
  eprintln!("{} writes still queued", summary.total());
  Ok(())
}
