//! `resilience` command-line tool.
//!
//! - `fetch <url>`: resilient GET through the coordinator
//! - `queue list|clear|replay`: inspect the durable action queue
//! - `listen`: hold the realtime connection open and print messages

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use resilient_client::config::ConfigWatcher;
use resilient_client::lifecycle::{self, wait_for_signal};
use resilient_client::upstream::UpstreamRequest;
use resilient_client::ResilienceFacade;

#[derive(Parser)]
#[command(name = "resilience")]
#[command(about = "Resilient client: cached and circuit-broken fetches, offline queue, realtime", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL through the resilience layer
    Fetch {
        url: String,
        /// Logical endpoint (circuit breaker and rate window)
        #[arg(short, long, default_value = "api")]
        endpoint: String,
        /// Number of times to issue the request
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,
    },
    /// Inspect the durable action queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Connect to the realtime endpoint and print messages until interrupted
    Listen,
}

#[derive(Subcommand)]
enum QueueCommand {
    /// List stored actions in replay order
    List,
    /// Delete every stored action
    Clear,
    /// Replay pending actions now
    Replay,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (config, facade) = lifecycle::start(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch { url, endpoint, repeat } => {
            for _ in 0..repeat.max(1) {
                match facade.fetch(&endpoint, UpstreamRequest::get(url.as_str())).await {
                    Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            println!("{}", serde_json::to_string_pretty(&facade.metrics())?);
        }
        Commands::Queue { command } => {
            if config.queue.store_path.is_none() {
                eprintln!("queue.store_path is not configured; the queue is in-memory only");
            }
            match command {
                QueueCommand::List => {
                    for action in facade.queue().peek_all() {
                        println!(
                            "{}  {:<16} {:<6} {:?}  attempts {}/{}{}",
                            action.id,
                            action.action_type,
                            action.priority,
                            action.status,
                            action.attempts,
                            action.max_retries,
                            action
                                .last_error
                                .as_deref()
                                .map(|e| format!("  last error: {}", e))
                                .unwrap_or_default()
                        );
                    }
                }
                QueueCommand::Clear => {
                    let removed = facade.queue().clear()?;
                    println!("removed {} actions", removed);
                }
                QueueCommand::Replay => {
                    let report = facade.drain_queue().await;
                    println!(
                        "succeeded {}, retried {}, failed {}",
                        report.succeeded, report.retried, report.failed
                    );
                }
            }
        }
        Commands::Listen => listen(&facade, cli.config).await?,
    }

    facade.shutdown().await;
    Ok(())
}

async fn listen(facade: &Arc<ResilienceFacade>, config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let _messages = facade.subscribe_realtime(|msg| {
        println!("{}", msg.to_text());
    })?;
    let _degraded = facade.on_degraded(|d| {
        eprintln!("realtime degraded after {} attempts: {}", d.attempts, d.last_error);
    })?;

    // Hot reload while listening
    let _watcher = match config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(&path);
            let watcher = watcher.run()?;
            let facade = Arc::clone(facade);
            tokio::spawn(async move {
                while let Some(config) = updates.recv().await {
                    facade.apply_config(config);
                }
            });
            Some(watcher)
        }
        None => None,
    };

    facade.connect_realtime()?;
    wait_for_signal().await;
    Ok(())
}
