//! Command-line driver for the StudyHub worker.
//!
//! Provides commands for:
//! - Installing the worker against a live origin into a snapshot file
//! - Listing what a snapshot holds
//! - Fetching a URL the way an installed worker would answer it, from the
//!   snapshot's cache (installing first only when that cache is missing)
//!
//! ## Usage
//!
//! ```bash
//! # Precache the app shell of a local dev server
//! sw-prime --config studyhub.json --snapshot cache.json install
//!
//! # Inspect the snapshot
//! sw-prime --snapshot cache.json list
//!
//! # Ask the worker for a page
//! sw-prime --snapshot cache.json fetch http://localhost:8080/chris/ --html
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use http::{header, HeaderValue};
use studyhub_common::{init_logging, LogConfig, LogFormat};
use studyhub_core::WorkerConfig;
use studyhub_net::{
    fetch_within, Fetcher, HttpFetcher, LoaderConfig, Request, RequestRouter, Response, Route,
};
use studyhub_sw::{CacheStore, FetchStrategy, Registration, Served, ServiceWorkerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "sw-prime")]
#[command(about = "Install and inspect the StudyHub offline worker")]
struct Cli {
    /// Worker configuration (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache snapshot file; overrides `cache_snapshot` from the config
    #[arg(short, long, global = true)]
    snapshot: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: String,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the worker, precaching the app shell
    Install,

    /// List caches and entries held by the snapshot
    List,

    /// Fetch a URL through the worker, serving from the snapshot's cache
    ///
    /// The worker is installed first only when the snapshot has no cache for
    /// the configured generation. A cache hit waits for its background
    /// refresh so the refreshed copy lands in the snapshot.
    Fetch {
        /// URL to request
        url: String,
        /// Send `Accept: text/html` as a navigation would
        #[arg(long)]
        html: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let format: LogFormat = cli.log_format.parse()?;
    let log = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log.with_format(format))?;

    let config = match &cli.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    let store = match cli.snapshot.as_ref().or(config.cache_snapshot.as_ref()) {
        Some(path) => CacheStore::persistent(path).await?,
        None => CacheStore::new(),
    };

    match cli.command {
        Commands::Install => {
            let (registration, events) = registration(config, store.clone())?;
            registration.register().await?;
            print_events(events);
            list(&store).await;
        }

        Commands::List => {
            list(&store).await;
        }

        Commands::Fetch { url, html } => {
            if !store.has(&config.cache_name).await {
                info!(cache = %config.cache_name, "Generation not in snapshot, installing");
                let (registration, events) = registration(config.clone(), store.clone())?;
                registration.register().await?;
                print_events(events);
            }

            let mut request = Request::get_str(&url)?;
            if html {
                request = request.header(header::ACCEPT, HeaderValue::from_static("text/html"));
            }
            let (source, response) = fetch(&config, store, http_fetcher(&config)?, &request).await?;
            println!("{} {}", response.status, response.url);
            println!("  Source:     {source}");
            println!("  Body:       {} bytes", response.body.len());
        }
    }

    Ok(())
}

fn registration(
    config: WorkerConfig,
    store: CacheStore,
) -> Result<(Registration, mpsc::UnboundedReceiver<ServiceWorkerEvent>), Box<dyn std::error::Error>>
{
    let fetcher = http_fetcher(&config)?;
    info!(origin = %config.origin, cache = %config.cache_name, "Registering worker");
    Ok(Registration::new(config, store, fetcher)?)
}

fn http_fetcher(config: &WorkerConfig) -> Result<Arc<HttpFetcher>, Box<dyn std::error::Error>> {
    let fetcher = HttpFetcher::new(LoaderConfig {
        timeout: config.network_timeout(),
        ..LoaderConfig::default()
    })?;
    Ok(Arc::new(fetcher))
}

/// Answer one request the way the active worker would, without
/// re-registering. Returns where the response came from.
async fn fetch(
    config: &WorkerConfig,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    request: &Request,
) -> Result<(&'static str, Response), Box<dyn std::error::Error>> {
    let router = RequestRouter::from_markers(&config.excluded_host_markers);
    if let Route::Passthrough(reason) = router.route(request) {
        debug!(url = %request.url, ?reason, "Passthrough");
        let response = fetch_within(fetcher.as_ref(), request, config.network_timeout()).await?;
        return Ok(("network (passthrough)", response));
    }

    let strategy = FetchStrategy::new(
        store,
        fetcher,
        config.cache_name.clone(),
        config.offline_url()?,
        config.network_timeout(),
    );
    let served = match strategy.respond(request).await? {
        Served::Cache {
            response,
            revalidation,
        } => {
            if let Err(err) = revalidation.await {
                warn!(error = %err, "Background refresh did not finish");
            }
            ("cache", response)
        }
        Served::Network(response) => ("network", response),
        Served::OfflineFallback(response) => ("offline fallback", response),
    };
    Ok(served)
}

fn print_events(mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
    while let Ok(event) = events.try_recv() {
        match serde_json::to_string(&event) {
            Ok(line) => println!("event {line}"),
            Err(_) => println!("event {event:?}"),
        }
    }
}

async fn list(store: &CacheStore) {
    let names = store.keys().await;
    if names.is_empty() {
        println!("No caches");
        return;
    }
    for name in names {
        let Ok(cache) = store.open(&name).await else {
            continue;
        };
        let keys = cache.keys().await;
        println!("{name} ({} entries)", keys.len());
        for key in keys {
            println!("  {key}");
        }
    }
}
