use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wallpost_core::{ContentItem, PostStatus};
use wallpost_storage::{connect_pool, PostRepository, SchemaManager};
use wallpost_sync::{service_from_config, DeliveryTarget, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "wallpost")]
#[command(about = "Ingest wall posts and hand them out for delivery one at a time")]
struct Cli {
    /// Read pages from a saved feed instead of the remote API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed and store new posts.
    Sync {
        #[arg(long, conflicts_with = "all")]
        limit: Option<usize>,
        #[arg(long)]
        all: bool,
    },
    /// Fetch the head of the feed and report how many posts qualify, storing nothing.
    Check {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Create or upgrade the database schema.
    Migrate,
    Stats,
    /// Claim random new posts and print them as JSON lines.
    Next {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    List {
        #[arg(long, default_value = "used")]
        status: PostStatus,
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        page_size: u32,
    },
    Show {
        key: String,
    },
    SetStatus {
        key: String,
        status: PostStatus,
    },
}

struct StdoutDelivery;

#[async_trait]
impl DeliveryTarget for StdoutDelivery {
    async fn deliver(&self, item: &ContentItem) -> Result<()> {
        println!("{}", serde_json::to_string(item)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.fixture {
        config.fixture_path = Some(path);
    }

    match cli.command.unwrap_or(Commands::Stats) {
        Commands::Sync { limit, all } => {
            let service = service_from_config(&config).await?;
            let max_items = if all { None } else { limit.or(config.sync_limit) };
            let summary = service.sync(max_items).await.context("sync failed")?;
            println!(
                "sync complete: run_id={} fetched={} extracted={} inserted={} stats: {}",
                summary.run_id, summary.fetched, summary.extracted, summary.inserted, summary.stats
            );
        }
        Commands::Check { limit } => {
            let service = service_from_config(&config).await?;
            let check = service.check(limit).await.context("feed check failed")?;
            println!(
                "feed items={} qualifying={}",
                check.fetched, check.qualifying
            );
            if let Some(sample) = check.sample {
                println!("example: {} photos={} {}", sample.natural_key, sample.media.len(), sample.permalink);
            }
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.repository_config()).await?;
            let report = SchemaManager::ensure(&pool).await?;
            println!(
                "migrate complete: created_table={} added_columns={:?} normalized={} backfilled_used_at={} cleared_used_at={}",
                report.created_table,
                report.added_columns,
                report.normalized_statuses,
                report.backfilled_used_at,
                report.cleared_used_at
            );
            pool.close().await;
        }
        Commands::Stats => {
            let repo = open_repository(&config).await?;
            println!("stats: {}", repo.stats().await?);
        }
        Commands::Next { count } => {
            let service = service_from_config(&config).await?;
            let report = service.deliver_next(&StdoutDelivery, count).await?;
            if report.delivered.is_empty() && report.failure.is_none() {
                eprintln!("nothing to deliver; stats: {}", report.stats);
            } else {
                eprintln!("delivered={} stats: {}", report.delivered.len(), report.stats);
            }
            if let Some(failure) = report.failure {
                anyhow::bail!("delivery of {} failed: {}", failure.natural_key, failure.error);
            }
        }
        Commands::List {
            status,
            page,
            page_size,
        } => {
            let repo = open_repository(&config).await?;
            let page = repo.list_page(status, page_size, page).await?;
            println!(
                "{}: page {}/{} (total {})",
                page.status,
                page.page_index + 1,
                page.max_page + 1,
                page.total
            );
            for (i, item) in page.items.iter().enumerate() {
                println!(
                    "{}) {} | photos={} | {}",
                    i + 1,
                    item.natural_key,
                    item.media.len(),
                    item.permalink
                );
            }
        }
        Commands::Show { key } => {
            let repo = open_repository(&config).await?;
            let item = repo
                .get(&key)
                .await?
                .with_context(|| format!("no post with key {key}"))?;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Commands::SetStatus { key, status } => {
            let repo = open_repository(&config).await?;
            if !repo.set_status(&key, status).await? {
                anyhow::bail!("no post with key {key}");
            }
            println!("{key} -> {status}");
        }
    }

    Ok(())
}

async fn open_repository(config: &SyncConfig) -> Result<PostRepository> {
    PostRepository::connect(&config.repository_config())
        .await
        .with_context(|| format!("opening {}", config.database_url))
}
