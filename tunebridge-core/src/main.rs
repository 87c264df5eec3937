//! tunebridge - cross-platform music link converter
//!
//! **Usage:**
//! ```bash
//! tunebridge [--config <file>] parse <url>
//! tunebridge [--config <file>] convert <url> [--to spotify,tidal]
//! tunebridge [--config <file>] task <task-id>
//! tunebridge init-config [path]
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tunebridge_common::config::{self, TomlConfig};
use tunebridge_common::events::{ConversionEvent, EventBus};
use tunebridge_common::{EntityKind, Platform, TaskStatus};
use uuid::Uuid;

use tunebridge_core::adapters::AdapterRegistry;
use tunebridge_core::db::{init_database_pool, SqliteTaskStore};
use tunebridge_core::delivery::{Delivery, EventBusDelivery, FanoutDelivery, WebhookDelivery};
use tunebridge_core::models::LinkInfo;
use tunebridge_core::services::{ConversionEngine, EventEmitter, TaskTracker};
use tunebridge_core::{HttpRedirectResolver, LinkParser};

/// Convert music links between streaming platforms
#[derive(Parser, Debug)]
#[clap(name = "tunebridge", version)]
struct Args {
    /// Configuration file (overrides TUNEBRIDGE_CONFIG and the default location)
    #[clap(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a link and print what it refers to
    Parse { url: String },

    /// Convert a track or playlist link
    Convert {
        url: String,

        /// Target platforms (default: every configured platform except the source)
        #[clap(long, value_delimiter = ',')]
        to: Vec<Platform>,
    },

    /// Show a stored playlist task
    Task { id: Uuid },

    /// Write a configuration file with default values
    InitConfig { path: Option<PathBuf> },
}

/// Wired pipeline for one CLI invocation
struct Runtime {
    engine: Arc<ConversionEngine>,
    event_bus: EventBus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::InitConfig { path } = &args.command {
        return init_config(path.clone());
    }

    let config = config::load_config(args.config.as_deref())?;
    tunebridge_common::logging::init_tracing(&config.logging)?;
    info!("tunebridge {}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Parse { url } => {
            let parser = link_parser()?;
            let link = parser.parse(&url).await?;
            println!("{}", serde_json::to_string_pretty(&link)?);
        }
        Command::Convert { url, to } => {
            let parser = link_parser()?;
            let link = parser.parse(&url).await?;
            let runtime = build_runtime(&config).await?;
            convert(&runtime, &link, &to).await?;
        }
        Command::Task { id } => {
            let runtime = build_runtime(&config).await?;
            let task = runtime.engine.task(id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}

fn init_config(path: Option<PathBuf>) -> Result<()> {
    let path = path
        .or_else(config::default_config_path)
        .ok_or_else(|| anyhow!("No config directory on this system; pass a path"))?;

    if path.exists() {
        return Err(anyhow!("{} already exists", path.display()));
    }

    config::write_toml_config(&TomlConfig::default(), &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn link_parser() -> Result<LinkParser> {
    let resolver = HttpRedirectResolver::new().context("Failed to build HTTP client")?;
    Ok(LinkParser::new(Arc::new(resolver)))
}

async fn build_runtime(config: &TomlConfig) -> Result<Runtime> {
    let db_path = config.database.resolved_path();
    info!("Database: {}", db_path.display());
    let pool = init_database_pool(&db_path).await?;
    let store = SqliteTaskStore::new(pool, config.database.max_lock_wait_ms);

    let event_bus = EventBus::new(config.delivery.event_bus_capacity);
    let bus_delivery: Arc<dyn Delivery> = Arc::new(EventBusDelivery::new(event_bus.clone()));
    let delivery = match &config.delivery.webhook_url {
        Some(url) => {
            info!("Delivering events to webhook {}", url);
            let webhook = WebhookDelivery::new(url.as_str(), config.delivery.webhook_attempts)?;
            Arc::new(FanoutDelivery::new(vec![bus_delivery, Arc::new(webhook)])) as Arc<dyn Delivery>
        }
        None => bus_delivery,
    };

    let registry = AdapterRegistry::from_config(config)?;
    info!("Platforms available: {:?}", registry.platforms());

    let tracker = TaskTracker::new(Arc::new(store), config.tasks.max_retries)
        .with_lease(Duration::from_millis(config.tasks.lease_ms));
    let emitter = EventEmitter::new(delivery).with_webhook_attempts(config.delivery.webhook_attempts);
    let engine = ConversionEngine::from_config(config, Arc::new(registry), Arc::new(tracker), emitter);

    Ok(Runtime {
        engine: Arc::new(engine),
        event_bus,
    })
}

async fn convert(runtime: &Runtime, link: &LinkInfo, to: &[Platform]) -> Result<()> {
    match link.kind {
        EntityKind::Track => {
            let result = runtime.engine.convert_track(link, to, None).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        EntityKind::Playlist => {
            // subscribe before the pipeline can emit anything
            let rx = runtime.event_bus.subscribe();
            let task = runtime.engine.convert_playlist(link, to, None).await?;
            info!(task_id = %task.id, status = %task.status, "Playlist task");

            // a processing task with no pipeline here is owned by another live process
            let started_here = task.status == TaskStatus::Processing
                && (runtime.engine.tracker().is_running(task.id).await
                    || runtime.engine.task(task.id).await?.is_terminal());

            if started_here {
                let events = EventBus::task_events(rx, task.id, task.retry_count);
                futures::pin_mut!(events);
                while let Some(event) = events.next().await {
                    print_event(&event)?;
                }
            }

            let task = runtime.engine.task(task.id).await?;
            match runtime.engine.playlist_result(&task.checksum).await? {
                Some(conversion) => println!("{}", serde_json::to_string_pretty(&conversion)?),
                None => println!("{}", serde_json::to_string_pretty(&task)?),
            }
            Ok(())
        }
        other => Err(anyhow!("{} links cannot be converted", other)),
    }
}

fn print_event(event: &ConversionEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}
