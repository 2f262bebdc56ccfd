//! Command-line host for the Propan offline worker.
//!
//! Drives the worker against a real origin with a durable SQLite cache, so the
//! same cache can be inspected across runs.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the app shell and activate
//! propan --config propan.json install
//!
//! # Run one request through the cache policies without network
//! propan fetch / --navigate --offline
//!
//! # Ask the control channel for a number below 50
//! propan message '{"type":"GENERATE_NUMBER","limite":"50"}'
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use propan_cache::{CacheStore, SqliteCacheStore};
use propan_common::{init_logging, LogConfig};
use propan_net::{Destination, Fetcher, FetcherConfig, HttpFetcher, OfflineFetcher, Request};
use propan_sw::{
    FetchEvent, MessageEvent, NotificationPermission, PushEvent, ReplyPort, ServiceWorker,
    SyncEvent, WorkerConfig,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "propan")]
#[command(about = "Command-line host for the Propan offline worker")]
struct Cli {
    /// Worker config (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite cache database
    #[arg(long, global = true, default_value = "propan-cache.db")]
    db: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the manifest, activate and list namespaces
    Install,

    /// Run one request through the policy engine
    Fetch {
        /// Root-relative path, e.g. /styles.css
        path: String,
        /// Request destination (document, style, script, image, ...)
        #[arg(short, long)]
        destination: Option<Destination>,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Reject every network request
        #[arg(long)]
        offline: bool,
    },

    /// List cache namespaces and their entry counts
    Namespaces,

    /// Delete every cache namespace
    Clear,

    /// Send a control message and print the reply
    Message {
        /// Message body as JSON
        json: String,
    },

    /// Dispatch a push event
    Push {
        /// Push payload as JSON
        #[arg(short, long)]
        payload: Option<String>,
        /// Grant notification permission first
        #[arg(long)]
        granted: bool,
    },

    /// Dispatch a background sync event
    Sync {
        /// Sync tag, e.g. sync-orders
        tag: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config);

    let config = load_config(cli.config.as_deref())?;
    let store: Arc<dyn CacheStore> = Arc::new(
        SqliteCacheStore::open(&cli.db)
            .with_context(|| format!("opening cache database {}", cli.db.display()))?,
    );

    match cli.command {
        Commands::Install => {
            let worker = worker(config, store.clone(), false)?;
            let report = worker.install().await?;
            println!("State: {}", worker.state().await);
            if let Some(report) = report {
                for name in &report.deleted_namespaces {
                    println!("Deleted stale namespace: {name}");
                }
            }
            print_namespaces(&*store).await?;
        }

        Commands::Fetch {
            path,
            destination,
            navigate,
            offline,
        } => {
            let url = config
                .resolve(&path)
                .with_context(|| format!("resolving {path}"))?;
            let worker = worker(config, store, offline)?;

            let mut request = if navigate {
                Request::navigate(url)
            } else {
                Request::get(url)
            };
            if let Some(destination) = destination {
                request = request.destination(destination);
            }

            let response = worker.handle_fetch(FetchEvent::new(request)).await;
            let status = response.status;
            let source = response.source;
            let body = response.bytes().await?;
            println!("Status: {status}");
            println!("Source: {source:?}");
            println!("Body:   {} bytes", body.len());
        }

        Commands::Namespaces => {
            print_namespaces(&*store).await?;
        }

        Commands::Clear => {
            let deleted = store.clear_all().await?;
            println!("Deleted {} namespace(s)", deleted.len());
            for name in deleted {
                println!("  {name}");
            }
        }

        Commands::Message { json } => {
            let data: serde_json::Value =
                serde_json::from_str(&json).context("message is not valid JSON")?;
            let worker = worker(config, store, false)?;
            let (port, mut replies) = ReplyPort::channel();

            let outcome = worker
                .post_message(MessageEvent::new(data).with_port(port))
                .await;
            println!("Outcome: {outcome:?}");
            while let Ok(reply) = replies.try_recv() {
                println!("Reply:   {reply}");
            }
        }

        Commands::Push { payload, granted } => {
            let worker = worker(config, store, true)?;
            if granted {
                worker
                    .set_notification_permission(NotificationPermission::Granted)
                    .await;
            }

            let data = payload.map(Bytes::from);
            match worker.push(PushEvent::new(data)).await? {
                Some(notification) => {
                    println!("{}", serde_json::to_string_pretty(&notification)?);
                }
                None => println!("No notification shown (permission not granted)"),
            }
        }

        Commands::Sync { tag } => {
            let worker = worker(config, store, true)?;
            let outcome = worker.sync(SyncEvent::new(tag.as_str())).await;
            println!("Outcome: {outcome:?}");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(WorkerConfig::default()),
    }
}

fn worker(config: WorkerConfig, store: Arc<dyn CacheStore>, offline: bool) -> Result<ServiceWorker> {
    let fetcher: Arc<dyn Fetcher> = if offline {
        Arc::new(OfflineFetcher)
    } else {
        Arc::new(HttpFetcher::new(FetcherConfig::default())?)
    };

    let (worker, _events) = ServiceWorker::register(config, store, fetcher)?;
    debug!(scope = %worker.registration().scope(), "Worker registered");
    Ok(worker)
}

async fn print_namespaces(store: &dyn CacheStore) -> Result<()> {
    let namespaces = store.list_namespaces().await?;
    if namespaces.is_empty() {
        println!("No cache namespaces");
        return Ok(());
    }

    println!("Namespaces:");
    for name in namespaces {
        let handle = store.open(&name).await?;
        let keys = store.keys(&handle).await?;
        println!("  {name:<24} {} entries", keys.len());
    }
    Ok(())
}
