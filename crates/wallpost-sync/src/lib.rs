//! Ingestion and delivery orchestration: the operations exposed to trigger
//! surfaces (sync, claim, status changes, listings, stats).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use wallpost_adapters::{
    ContentFetcher, FeedCheck, FeedError, FetchConfig, FixturePageSource, PageSource,
    VkWallConfig, VkWallSource,
};
use wallpost_core::{ContentItem, PostPage, PostStatus, StatusCounts};
use wallpost_storage::{PostRepository, RepositoryConfig, StorageError};

pub const CRATE_NAME: &str = "wallpost-sync";

/// Most items handed out by a single delivery batch (one album per item).
pub const MAX_DELIVERY_BATCH: usize = 10;

const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub vk_token: Option<String>,
    pub vk_owner_id: Option<String>,
    pub vk_api_base: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_delay_ms: u64,
    /// Items to request per sync; `None` walks the whole feed.
    pub sync_limit: Option<usize>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_url = var("DATABASE_URL")
            .or_else(|| var("DB_PATH").map(|path| format!("sqlite://{path}")))
            .unwrap_or_else(|| "sqlite://wallpost.db".to_string());

        Self {
            database_url,
            vk_token: var("VK_TOKEN"),
            vk_owner_id: var("VK_OWNER_ID"),
            vk_api_base: var("VK_API_BASE"),
            fixture_path: var("WALLPOST_FIXTURE").map(PathBuf::from),
            user_agent: var("WALLPOST_USER_AGENT").unwrap_or_else(|| "wallpost/0.1".to_string()),
            http_timeout_secs: var("WALLPOST_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            page_delay_ms: var("WALLPOST_PAGE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(350),
            sync_limit: match var("WALLPOST_SYNC_LIMIT").and_then(|v| v.parse::<usize>().ok()) {
                Some(0) => None,
                Some(limit) => Some(limit),
                None => Some(200),
            },
        }
    }

    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig::new(self.database_url.clone())
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            page_delay: Duration::from_millis(self.page_delay_ms),
            ..Default::default()
        }
    }

    pub fn vk_wall_config(&self) -> Result<VkWallConfig, SyncError> {
        let token = self.vk_token.clone().ok_or(SyncError::MissingConfig("VK_TOKEN"))?;
        let owner = self
            .vk_owner_id
            .clone()
            .ok_or(SyncError::MissingConfig("VK_OWNER_ID"))?;
        let mut config = VkWallConfig::new(token, owner);
        if let Some(base) = &self.vk_api_base {
            config.base_url = base.clone();
        }
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config.user_agent = Some(self.user_agent.clone());
        Ok(config)
    }

    /// Fixture feed when one is configured, otherwise the remote wall.
    pub async fn page_source(&self) -> Result<Box<dyn PageSource>, SyncError> {
        if let Some(path) = &self.fixture_path {
            return Ok(Box::new(FixturePageSource::load(path).await?));
        }
        Ok(Box::new(VkWallSource::new(self.vk_wall_config()?)?))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub extracted: usize,
    pub inserted: u64,
    pub stats: StatusCounts,
}

/// Downstream channel a claimed item is handed to.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    async fn deliver(&self, item: &ContentItem) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryFailure {
    pub natural_key: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failure: Option<DeliveryFailure>,
    pub stats: StatusCounts,
}

pub struct ContentService<S> {
    fetcher: ContentFetcher<S>,
    repo: PostRepository,
}

impl<S: PageSource> ContentService<S> {
    pub fn new(fetcher: ContentFetcher<S>, repo: PostRepository) -> Self {
        Self { fetcher, repo }
    }

    pub fn repository(&self) -> &PostRepository {
        &self.repo
    }

    /// Fetch, extract and upsert. A failed fetch stores nothing.
    pub async fn sync(&self, max_items: Option<usize>) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async move {
            let started_at = Utc::now();
            let items = self.fetcher.fetch_all(max_items).await?;
            let drafts = self.fetcher.extract_items(&items);
            let inserted = self.repo.upsert_many(&drafts).await?;
            let stats = self.repo.stats().await?;
            let finished_at = Utc::now();

            info!(
                fetched = items.len(),
                extracted = drafts.len(),
                inserted,
                %stats,
                "sync complete"
            );
            Ok::<_, SyncError>(SyncRunSummary {
                run_id,
                started_at,
                finished_at,
                fetched: items.len(),
                extracted: drafts.len(),
                inserted,
                stats,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn check(&self, limit: usize) -> Result<FeedCheck, SyncError> {
        Ok(self.fetcher.check(limit).await?)
    }

    pub async fn claim(&self) -> Result<Option<ContentItem>, SyncError> {
        Ok(self.repo.claim().await?)
    }

    pub async fn get(&self, natural_key: &str) -> Result<Option<ContentItem>, SyncError> {
        Ok(self.repo.get(natural_key).await?)
    }

    pub async fn set_status(&self, natural_key: &str, status: PostStatus) -> Result<bool, SyncError> {
        Ok(self.repo.set_status(natural_key, status).await?)
    }

    pub async fn list_page(
        &self,
        status: PostStatus,
        page_size: u32,
        page_index: u32,
    ) -> Result<PostPage, SyncError> {
        Ok(self.repo.list_page(status, page_size, page_index).await?)
    }

    pub async fn stats(&self) -> Result<StatusCounts, SyncError> {
        Ok(self.repo.stats().await?)
    }

    /// Claim up to `count` items (clamped to `1..=MAX_DELIVERY_BATCH`) and hand
    /// each to `target`. A failed delivery puts its item back into the pool and
    /// ends the batch.
    pub async fn deliver_next(
        &self,
        target: &dyn DeliveryTarget,
        count: usize,
    ) -> Result<DeliveryReport, SyncError> {
        let count = count.clamp(1, MAX_DELIVERY_BATCH);
        let mut delivered = Vec::new();
        let mut failure = None;

        for _ in 0..count {
            let Some(item) = self.claim_with_retry().await? else {
                break;
            };
            match target.deliver(&item).await {
                Ok(()) => delivered.push(item.natural_key),
                Err(err) => {
                    warn!(natural_key = %item.natural_key, error = %err, "delivery failed, releasing item");
                    self.repo.release(&item.natural_key).await?;
                    failure = Some(DeliveryFailure {
                        natural_key: item.natural_key,
                        error: format!("{err:#}"),
                    });
                    break;
                }
            }
        }

        let stats = self.repo.stats().await?;
        info!(delivered = delivered.len(), failed = failure.is_some(), %stats, "delivery batch finished");
        Ok(DeliveryReport {
            delivered,
            failure,
            stats,
        })
    }

    async fn claim_with_retry(&self) -> Result<Option<ContentItem>, SyncError> {
        for _ in 0..CLAIM_ATTEMPTS {
            if let Some(item) = self.repo.claim().await? {
                return Ok(Some(item));
            }
            if self.repo.count_by_status(PostStatus::New).await? == 0 {
                break;
            }
        }
        Ok(None)
    }
}

/// Build a service from environment configuration.
pub async fn service_from_config(
    config: &SyncConfig,
) -> Result<ContentService<Box<dyn PageSource>>, SyncError> {
    let source = config.page_source().await?;
    let repo = PostRepository::connect(&config.repository_config()).await?;
    Ok(ContentService::new(
        ContentFetcher::new(source, config.fetch_config()),
        repo,
    ))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, SyncError> {
    let config = SyncConfig::from_env();
    let service = service_from_config(&config).await?;
    service.sync(config.sync_limit).await
}
