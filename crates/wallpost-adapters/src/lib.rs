//! Feed page sources and the extraction of content drafts from raw wall items.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use wallpost_core::{ContentDraft, MediaList, MAX_MEDIA};

pub const CRATE_NAME: &str = "wallpost-adapters";

/// Hard cap on items per page request imposed by the remote API.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WallItem {
    pub id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "is_pinned")]
    pub pinned: i64,
    #[serde(default, rename = "marked_as_ads")]
    pub ads: i64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl WallItem {
    pub fn is_pinned(&self) -> bool {
        self.pinned != 0
    }

    pub fn is_promoted(&self) -> bool {
        self.ads != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<Photo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub sizes: Vec<PhotoSize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhotoSize {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl PhotoSize {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// One page of raw items plus the total the feed reports for the owner.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPage {
    pub items: Vec<WallItem>,
    pub reported_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedErrorKind {
    Transport,
    Protocol,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("feed returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed feed response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("feed error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("feed response carried neither items nor an error")]
    MissingResponse,
    #[error("reading feed fixture {}: {source}", .path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FeedError {
    pub fn kind(&self) -> FeedErrorKind {
        match self {
            FeedError::Transport(_) | FeedError::Fixture { .. } => FeedErrorKind::Transport,
            FeedError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FeedErrorKind::Protocol),
            FeedError::Malformed(_) | FeedError::Remote { .. } | FeedError::MissingResponse => {
                FeedErrorKind::Protocol
            }
        }
    }
}

pub fn classify_status(status: StatusCode) -> FeedErrorKind {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FeedErrorKind::Transport
    } else {
        FeedErrorKind::Protocol
    }
}

/// Capability to fetch one page of the owner's feed.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn owner_key(&self) -> &str;

    async fn fetch_page(&self, count: u32, offset: u64) -> Result<RawPage, FeedError>;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for Box<T> {
    fn owner_key(&self) -> &str {
        (**self).owner_key()
    }

    async fn fetch_page(&self, count: u32, offset: u64) -> Result<RawPage, FeedError> {
        (**self).fetch_page(count, offset).await
    }
}

#[derive(Debug, Deserialize)]
struct WallEnvelope {
    #[serde(default)]
    response: Option<WallBody>,
    #[serde(default)]
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct WallBody {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    items: Vec<WallItem>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

/// Decode a `wall.get` response body, surfacing remote error envelopes.
pub fn decode_wall_response(body: &[u8]) -> Result<RawPage, FeedError> {
    let envelope: WallEnvelope = serde_json::from_slice(body)?;
    if let Some(err) = envelope.error {
        return Err(FeedError::Remote {
            code: err.error_code,
            message: err.error_msg,
        });
    }
    let body = envelope.response.ok_or(FeedError::MissingResponse)?;
    Ok(RawPage {
        items: body.items,
        reported_total: body.count,
    })
}

#[derive(Debug, Clone)]
pub struct VkWallConfig {
    pub base_url: String,
    pub access_token: String,
    pub owner_id: String,
    pub api_version: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl VkWallConfig {
    pub fn new(access_token: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.vk.com/method".to_string(),
            access_token: access_token.into(),
            owner_id: owner_id.into(),
            api_version: "5.131".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// HTTP page source for a community wall.
#[derive(Debug, Clone)]
pub struct VkWallSource {
    client: reqwest::Client,
    config: VkWallConfig,
}

impl VkWallSource {
    pub fn new(config: VkWallConfig) -> Result<Self, FeedError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/wall.get", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl PageSource for VkWallSource {
    fn owner_key(&self) -> &str {
        &self.config.owner_id
    }

    async fn fetch_page(&self, count: u32, offset: u64) -> Result<RawPage, FeedError> {
        let count = count.clamp(1, MAX_PAGE_SIZE);
        let resp = self
            .client
            .get(self.endpoint())
            .query(&[
                ("owner_id", self.config.owner_id.as_str()),
                ("count", count.to_string().as_str()),
                ("offset", offset.to_string().as_str()),
                ("filter", "owner"),
                ("access_token", self.config.access_token.as_str()),
                ("v", self.config.api_version.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.without_url()))?;

        let status = resp.status();
        if !status.is_success() {
            // the query string carries the access token
            let mut url = resp.url().clone();
            url.set_query(None);
            return Err(FeedError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FeedError::Transport(e.without_url()))?;
        decode_wall_response(&body)
    }
}

/// Saved feed used for offline runs: pages are sliced out of `items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFeed {
    pub owner_key: String,
    #[serde(default)]
    pub reported_total: Option<u64>,
    pub items: Vec<WallItem>,
}

#[derive(Debug, Clone)]
pub struct FixturePageSource {
    feed: FixtureFeed,
}

impl FixturePageSource {
    pub fn new(feed: FixtureFeed) -> Self {
        Self { feed }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| FeedError::Fixture {
                path: path.to_path_buf(),
                source,
            })?;
        let feed: FixtureFeed = serde_json::from_slice(&data)?;
        Ok(Self::new(feed))
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn owner_key(&self) -> &str {
        &self.feed.owner_key
    }

    async fn fetch_page(&self, count: u32, offset: u64) -> Result<RawPage, FeedError> {
        let count = count.clamp(1, MAX_PAGE_SIZE) as usize;
        let items = &self.feed.items;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(items.len());
        let end = start.saturating_add(count).min(items.len());
        Ok(RawPage {
            items: items[start..end].to_vec(),
            reported_total: self
                .feed
                .reported_total
                .unwrap_or(items.len() as u64),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchConfig {
    pub page_size: u32,
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            page_delay: Duration::from_millis(350),
        }
    }
}

/// Outcome of a dry run over the head of the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCheck {
    pub fetched: usize,
    pub qualifying: usize,
    pub sample: Option<ContentDraft>,
}

pub struct ContentFetcher<S> {
    source: S,
    config: FetchConfig,
}

impl<S: PageSource> ContentFetcher<S> {
    pub fn new(source: S, config: FetchConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch pages sequentially until `max_items` items were collected or the
    /// feed is exhausted. `None` walks the whole feed. Any page failure aborts
    /// the fetch with no partial result.
    pub async fn fetch_all(&self, max_items: Option<usize>) -> Result<Vec<WallItem>, FeedError> {
        let page_size = self.config.page_size.clamp(1, MAX_PAGE_SIZE);
        let mut all: Vec<WallItem> = Vec::new();
        let mut offset = 0u64;
        let mut total: Option<u64> = None;

        loop {
            let mut want = page_size;
            if let Some(limit) = max_items {
                let remain = limit.saturating_sub(all.len());
                if remain == 0 {
                    break;
                }
                want = want.min(u32::try_from(remain).unwrap_or(u32::MAX));
            }

            if offset > 0 && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }

            let span = info_span!("feed_page", owner = self.source.owner_key(), offset, count = want);
            let page = self
                .source
                .fetch_page(want, offset)
                .instrument(span)
                .await?;
            let reported = *total.get_or_insert(page.reported_total);
            debug!(offset, received = page.items.len(), reported, "fetched feed page");

            if page.items.is_empty() {
                break;
            }

            offset += page.items.len() as u64;
            all.extend(page.items);

            if offset >= reported {
                break;
            }
        }

        if let Some(limit) = max_items {
            all.truncate(limit);
        }
        info!(owner = self.source.owner_key(), fetched = all.len(), "feed fetch complete");
        Ok(all)
    }

    pub fn extract_items(&self, items: &[WallItem]) -> Vec<ContentDraft> {
        extract_items(self.source.owner_key(), items)
    }

    pub async fn check(&self, limit: usize) -> Result<FeedCheck, FeedError> {
        let items = self.fetch_all(Some(limit)).await?;
        let drafts = self.extract_items(&items);
        Ok(FeedCheck {
            fetched: items.len(),
            qualifying: drafts.len(),
            sample: drafts.into_iter().next(),
        })
    }
}

/// Largest variant by pixel area; the first one wins ties. Variants without a
/// URL are ignored.
pub fn best_photo_url(photo: &Photo) -> Option<&str> {
    let mut best: Option<&PhotoSize> = None;
    for size in photo.sizes.iter().filter(|s| !s.url.is_empty()) {
        match best {
            Some(current) if size.area() <= current.area() => {}
            _ => best = Some(size),
        }
    }
    best.map(|s| s.url.as_str())
}

/// Turn raw wall items into drafts: pinned and promoted items are dropped, each
/// photo attachment contributes its best variant (up to [`MAX_MEDIA`]) and items
/// without photos are dropped. Input order is preserved.
pub fn extract_items(owner_key: &str, items: &[WallItem]) -> Vec<ContentDraft> {
    items
        .iter()
        .filter(|item| !item.is_pinned() && !item.is_promoted())
        .filter_map(|item| {
            let urls: Vec<String> = item
                .attachments
                .iter()
                .filter(|att| att.kind == "photo")
                .filter_map(|att| att.photo.as_ref())
                .filter_map(best_photo_url)
                .take(MAX_MEDIA)
                .map(str::to_string)
                .collect();
            let media = MediaList::try_from(urls).ok()?;
            Some(ContentDraft::new(
                owner_key,
                item.id.to_string(),
                item.text.clone(),
                media,
            ))
        })
        .collect()
}
