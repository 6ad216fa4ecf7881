use anyhow::Result;
use clap::{Parser, Subcommand};
use nbsync_sync::{DiscoveryConfig, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nbsync")]
#[command(about = "Mirror subscribed neighbor posts into a Notion database")]
struct Cli {
    /// Overrides MAX_PAGES for this run.
    #[arg(long, global = true)]
    max_pages: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the subscription feed and upsert posts (default).
    Feed,
    /// Scrape the neighbor admin pages into a CSV.
    Discover,
}

const DEFAULT_LOG_FILTER: &str = "nbsync=info";

/// `RUST_LOG` wins as given; the default applies only when it is unset or unparsable.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Feed) {
        Commands::Feed => {
            let mut config = SyncConfig::from_env()?;
            if let Some(max_pages) = cli.max_pages {
                config.max_pages = max_pages;
            }
            let summary = nbsync_sync::run_feed_once(config).await?;
            println!(
                "feed complete: run_id={} pages={} seen={} skipped={} created={} updated={} unchanged={} failed={}",
                summary.run_id,
                summary.pages_fetched,
                summary.items_seen,
                summary.skipped_missing,
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.failed
            );
        }
        Commands::Discover => {
            let mut config = DiscoveryConfig::from_env()?;
            if let Some(max_pages) = cli.max_pages {
                config.max_pages = max_pages;
            }
            let summary = nbsync_sync::run_discovery(config).await?;
            println!(
                "discovery complete: run_id={} pages={} neighbors={} influencers={} output={}",
                summary.run_id,
                summary.pages_fetched,
                summary.neighbors,
                summary.influencers,
                summary.output
            );
        }
    }

    Ok(())
}
