//! Core domain model for wallpost: content items, delivery status and page views.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "wallpost-core";

/// Upper bound on media attached to a single item (one album).
pub const MAX_MEDIA: usize = 10;

pub const PERMALINK_BASE: &str = "https://vk.com/wall";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported status: {0:?} (expected \"new\" or \"used\")")]
pub struct InvalidStatus(pub String);

/// Delivery lifecycle of a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    New,
    Used,
}

impl PostStatus {
    pub const ALL: [PostStatus; 2] = [PostStatus::New, PostStatus::Used];

    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::New => "new",
            PostStatus::Used => "used",
        }
    }

    /// Lenient mapping for values read back from storage: anything that is not
    /// a canonical status is treated as `New`.
    pub fn from_stored(value: &str) -> Self {
        match value {
            "used" => PostStatus::Used,
            _ => PostStatus::New,
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "new" => Ok(PostStatus::New),
            "used" => Ok(PostStatus::Used),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaListError {
    #[error("media list is empty")]
    Empty,
    #[error("media list has {0} entries, at most {MAX_MEDIA} allowed")]
    TooMany(usize),
}

/// Ordered, non-empty list of media URLs capped at [`MAX_MEDIA`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct MediaList(Vec<String>);

impl MediaList {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl TryFrom<Vec<String>> for MediaList {
    type Error = MediaListError;

    fn try_from(urls: Vec<String>) -> Result<Self, Self::Error> {
        match urls.len() {
            0 => Err(MediaListError::Empty),
            n if n > MAX_MEDIA => Err(MediaListError::TooMany(n)),
            _ => Ok(Self(urls)),
        }
    }
}

impl From<MediaList> for Vec<String> {
    fn from(list: MediaList) -> Self {
        list.0
    }
}

pub fn natural_key(owner_key: &str, item_key: &str) -> String {
    format!("{owner_key}_{item_key}")
}

pub fn permalink_for(natural_key: &str) -> String {
    format!("{PERMALINK_BASE}{natural_key}")
}

/// Extracted candidate handed from the feed adapters into the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDraft {
    pub owner_key: String,
    pub item_key: String,
    pub natural_key: String,
    pub permalink: String,
    pub text: String,
    pub media: MediaList,
}

impl ContentDraft {
    pub fn new(
        owner_key: impl Into<String>,
        item_key: impl Into<String>,
        text: impl Into<String>,
        media: MediaList,
    ) -> Self {
        let owner_key = owner_key.into();
        let item_key = item_key.into();
        let natural_key = natural_key(&owner_key, &item_key);
        let permalink = permalink_for(&natural_key);
        Self {
            owner_key,
            item_key,
            natural_key,
            permalink,
            text: text.into(),
            media,
        }
    }
}

/// Persisted content item. Timestamps are unix seconds; `used_at` is zero
/// unless the item is `Used`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub owner_key: String,
    pub item_key: String,
    pub natural_key: String,
    pub permalink: String,
    pub text: String,
    pub media: Vec<String>,
    pub status: PostStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub used_at: i64,
}

impl ContentItem {
    pub fn used_at_utc(&self) -> Option<DateTime<Utc>> {
        if self.used_at == 0 {
            return None;
        }
        Utc.timestamp_opt(self.used_at, 0).single()
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.created_at, 0).single()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub new: u64,
    pub used: u64,
}

impl StatusCounts {
    pub fn get(&self, status: PostStatus) -> u64 {
        match status {
            PostStatus::New => self.new,
            PostStatus::Used => self.used,
        }
    }

    pub fn total(&self) -> u64 {
        self.new + self.used
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "new={} used={}", self.new, self.used)
    }
}

/// One page of a status listing, with the page index after clamping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostPage {
    pub status: PostStatus,
    pub items: Vec<ContentItem>,
    pub total: u64,
    pub page_size: u32,
    pub page_index: u32,
    pub max_page: u32,
}

/// Highest valid zero-based page index for `total` rows.
pub fn max_page_index(total: u64, page_size: u32) -> u32 {
    if total == 0 || page_size == 0 {
        return 0;
    }
    let pages = total.div_ceil(u64::from(page_size));
    u32::try_from(pages - 1).unwrap_or(u32::MAX)
}
