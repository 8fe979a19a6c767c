//! SQLite-backed post repository: schema upgrades, idempotent ingestion and
//! the atomic claim used to hand items out for delivery.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use wallpost_core::{
    max_page_index, ContentDraft, ContentItem, PostPage, PostStatus, StatusCounts,
};

pub const CRATE_NAME: &str = "wallpost-storage";

pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("media list codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub database_url: String,
    /// Writers take the database lock up front and queue behind `busy_timeout`,
    /// so extra connections are safe but only speed up reads.
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://wallpost.db".to_string(),
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl RepositoryConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// What a schema pass changed. A second pass over the same database reports
/// nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub created_table: bool,
    pub added_columns: Vec<&'static str>,
    pub normalized_statuses: u64,
    pub backfilled_used_at: u64,
    pub cleared_used_at: u64,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        !self.created_table
            && self.added_columns.is_empty()
            && self.normalized_statuses == 0
            && self.backfilled_used_at == 0
            && self.cleared_used_at == 0
    }
}

const CREATE_POSTS: &str = r#"
CREATE TABLE IF NOT EXISTS posts (
    natural_key TEXT PRIMARY KEY,
    owner_key   TEXT NOT NULL,
    item_key    TEXT NOT NULL,
    permalink   TEXT NOT NULL,
    text        TEXT NOT NULL,
    media_json  TEXT NOT NULL DEFAULT '[]',
    status      TEXT NOT NULL DEFAULT 'new',
    created_at  INTEGER NOT NULL DEFAULT 0,
    updated_at  INTEGER NOT NULL DEFAULT 0,
    used_at     INTEGER NOT NULL DEFAULT 0
)
"#;

/// Columns added after the first schema version, in the order they are applied.
const UPGRADE_COLUMNS: &[(&str, &str)] = &[
    ("permalink", "ALTER TABLE posts ADD COLUMN permalink TEXT NOT NULL DEFAULT ''"),
    ("text", "ALTER TABLE posts ADD COLUMN text TEXT NOT NULL DEFAULT ''"),
    ("media_json", "ALTER TABLE posts ADD COLUMN media_json TEXT NOT NULL DEFAULT '[]'"),
    ("status", "ALTER TABLE posts ADD COLUMN status TEXT NOT NULL DEFAULT 'new'"),
    ("created_at", "ALTER TABLE posts ADD COLUMN created_at INTEGER NOT NULL DEFAULT 0"),
    ("updated_at", "ALTER TABLE posts ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0"),
    ("used_at", "ALTER TABLE posts ADD COLUMN used_at INTEGER NOT NULL DEFAULT 0"),
];

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_posts_status_usedat ON posts(status, used_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_posts_status_createdat ON posts(status, created_at DESC)",
];

pub struct SchemaManager;

impl SchemaManager {
    /// Create or upgrade the `posts` table and normalize legacy rows.
    pub async fn ensure(pool: &SqlitePool) -> Result<MigrationReport, StorageError> {
        let mut report = MigrationReport::default();
        let mut tx = begin_write(pool).await?;

        let existing = Self::table_columns(&mut tx).await?;
        if existing.is_empty() {
            sqlx::query(CREATE_POSTS).execute(&mut *tx).await?;
            report.created_table = true;
        } else {
            for (name, ddl) in UPGRADE_COLUMNS {
                if !existing.contains(*name) {
                    sqlx::query(ddl).execute(&mut *tx).await?;
                    report.added_columns.push(*name);
                }
            }
        }

        for ddl in CREATE_INDEXES {
            sqlx::query(ddl).execute(&mut *tx).await?;
        }

        report.normalized_statuses = sqlx::query(
            "UPDATE posts SET status = 'new', used_at = 0 WHERE status NOT IN ('new', 'used')",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        report.backfilled_used_at = sqlx::query(
            r#"
            UPDATE posts
            SET used_at = CASE
                WHEN updated_at > 0 THEN updated_at
                WHEN created_at > 0 THEN created_at
                ELSE ?
            END
            WHERE status = 'used' AND used_at = 0
            "#,
        )
        .bind(unix_now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        report.cleared_used_at =
            sqlx::query("UPDATE posts SET used_at = 0 WHERE status = 'new' AND used_at <> 0")
                .execute(&mut *tx)
                .await?
                .rows_affected();

        tx.commit().await?;
        Ok(report)
    }

    async fn table_columns(
        conn: &mut sqlx::SqliteConnection,
    ) -> Result<HashSet<String>, StorageError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('posts')")
                .fetch_all(conn)
                .await?;
        Ok(names.into_iter().collect())
    }
}

const SELECT_POST: &str = r#"
    SELECT
        natural_key, owner_key, item_key, permalink, text, media_json,
        status, created_at, updated_at, used_at
    FROM posts
"#;

#[derive(Debug, FromRow)]
struct PostRow {
    natural_key: String,
    owner_key: String,
    item_key: String,
    permalink: String,
    text: String,
    media_json: String,
    status: String,
    created_at: i64,
    updated_at: i64,
    used_at: i64,
}

impl TryFrom<PostRow> for ContentItem {
    type Error = serde_json::Error;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        let media: Vec<String> = serde_json::from_str(&row.media_json)?;
        let status = PostStatus::from_stored(&row.status);
        let used_at = match status {
            PostStatus::Used => row.used_at,
            PostStatus::New => 0,
        };
        Ok(ContentItem {
            owner_key: row.owner_key,
            item_key: row.item_key,
            natural_key: row.natural_key,
            permalink: row.permalink,
            text: row.text,
            media,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            used_at,
        })
    }
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

async fn count_status(
    conn: &mut sqlx::SqliteConnection,
    status: PostStatus,
) -> Result<u64, StorageError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(conn)
        .await?;
    Ok(count.max(0) as u64)
}

fn order_clause(status: PostStatus) -> &'static str {
    match status {
        PostStatus::New => "created_at DESC, natural_key DESC",
        PostStatus::Used => "used_at DESC, natural_key DESC",
    }
}

/// Start a transaction that holds the write lock from its first statement.
/// A deferred transaction that reads first cannot wait for the lock when it
/// later writes, and fails with `SQLITE_BUSY` instead.
async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>, StorageError> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

/// Open a pool without touching the schema.
pub async fn connect_pool(config: &RepositoryConfig) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Sole owner of persisted item state. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct PostRepository {
    pool: SqlitePool,
}

impl PostRepository {
    pub async fn connect(config: &RepositoryConfig) -> Result<Self, StorageError> {
        Self::from_pool(connect_pool(config).await?).await
    }

    /// Wrap an existing pool, bringing its schema up to date first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let report = SchemaManager::ensure(&pool).await?;
        if report.is_noop() {
            debug!("posts schema up to date");
        } else {
            info!(
                created_table = report.created_table,
                added_columns = ?report.added_columns,
                normalized_statuses = report.normalized_statuses,
                backfilled_used_at = report.backfilled_used_at,
                cleared_used_at = report.cleared_used_at,
                "posts schema migrated"
            );
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert unseen drafts as `New` and refresh content of known ones, all in
    /// one transaction. Returns the number of newly inserted rows.
    pub async fn upsert_many(&self, drafts: &[ContentDraft]) -> Result<u64, StorageError> {
        if drafts.is_empty() {
            return Ok(0);
        }

        let span = info_span!("upsert_many", batch = drafts.len());
        async move {
            let now = unix_now();
            let mut tx = begin_write(&self.pool).await?;
            let mut inserted = 0u64;

            for draft in drafts {
                let media_json = serde_json::to_string(draft.media.as_slice())?;
                let created = sqlx::query(
                    r#"
                    INSERT INTO posts
                        (natural_key, owner_key, item_key, permalink, text, media_json,
                         status, created_at, updated_at, used_at)
                    VALUES (?, ?, ?, ?, ?, ?, 'new', ?, ?, 0)
                    ON CONFLICT(natural_key) DO NOTHING
                    "#,
                )
                .bind(&draft.natural_key)
                .bind(&draft.owner_key)
                .bind(&draft.item_key)
                .bind(&draft.permalink)
                .bind(&draft.text)
                .bind(&media_json)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if created > 0 {
                    inserted += created;
                    continue;
                }

                sqlx::query(
                    r#"
                    UPDATE posts
                    SET permalink = ?, text = ?, media_json = ?, updated_at = MAX(updated_at, ?)
                    WHERE natural_key = ?
                    "#,
                )
                .bind(&draft.permalink)
                .bind(&draft.text)
                .bind(&media_json)
                .bind(now)
                .bind(&draft.natural_key)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            debug!(inserted, "upsert batch committed");
            Ok::<_, StorageError>(inserted)
        }
        .instrument(span)
        .await
    }

    pub async fn get(&self, natural_key: &str) -> Result<Option<ContentItem>, StorageError> {
        let query = format!("{SELECT_POST} WHERE natural_key = ?");
        let row = sqlx::query_as::<_, PostRow>(&query)
            .bind(natural_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ContentItem::try_from).transpose()?)
    }

    /// Pick one `New` item uniformly at random and mark it `Used` in the same
    /// transaction. The update only applies while the row is still `New`; if a
    /// concurrent caller got there first this call returns `None` and the
    /// caller may try again.
    pub async fn claim(&self) -> Result<Option<ContentItem>, StorageError> {
        let mut tx = begin_write(&self.pool).await?;

        let eligible: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE status = 'new'")
            .fetch_one(&mut *tx)
            .await?;
        if eligible == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let offset = fastrand::i64(0..eligible);
        let query = format!(
            "{SELECT_POST} WHERE status = 'new' ORDER BY natural_key LIMIT 1 OFFSET ?"
        );
        let Some(row) = sqlx::query_as::<_, PostRow>(&query)
            .bind(offset)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut item = ContentItem::try_from(row)?;

        let now = unix_now();
        let claimed = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'used', used_at = ?, updated_at = MAX(updated_at, ?)
            WHERE natural_key = ? AND status = 'new'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&item.natural_key)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            debug!(natural_key = %item.natural_key, "claim lost race");
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;

        item.status = PostStatus::Used;
        item.used_at = now;
        item.updated_at = item.updated_at.max(now);
        info!(natural_key = %item.natural_key, eligible, "claimed post");
        Ok(Some(item))
    }

    /// Returns `false` when no item has this key.
    pub async fn set_status(
        &self,
        natural_key: &str,
        status: PostStatus,
    ) -> Result<bool, StorageError> {
        let now = unix_now();
        let used_at = match status {
            PostStatus::Used => now,
            PostStatus::New => 0,
        };
        let mut tx = begin_write(&self.pool).await?;
        let affected = sqlx::query(
            r#"
            UPDATE posts
            SET status = ?, used_at = ?, updated_at = MAX(updated_at, ?)
            WHERE natural_key = ?
            "#,
        )
        .bind(status.as_str())
        .bind(used_at)
        .bind(now)
        .bind(natural_key)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        debug!(natural_key, %status, affected, "set status");
        Ok(affected > 0)
    }

    /// Put an item back into the `New` pool.
    pub async fn release(&self, natural_key: &str) -> Result<bool, StorageError> {
        self.set_status(natural_key, PostStatus::New).await
    }

    /// One page of items with `status`. Out-of-range page indexes are clamped
    /// to the last page; a zero page size falls back to [`DEFAULT_PAGE_SIZE`].
    pub async fn list_page(
        &self,
        status: PostStatus,
        page_size: u32,
        page_index: u32,
    ) -> Result<PostPage, StorageError> {
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size
        };
        let mut tx = self.pool.begin().await?;
        let total = count_status(&mut tx, status).await?;
        let max_page = max_page_index(total, page_size);
        let page_index = page_index.min(max_page);
        let offset = i64::from(page_index) * i64::from(page_size);

        let query = format!(
            "{SELECT_POST} WHERE status = ? ORDER BY {} LIMIT ? OFFSET ?",
            order_clause(status)
        );
        let rows = sqlx::query_as::<_, PostRow>(&query)
            .bind(status.as_str())
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        let items = rows
            .into_iter()
            .map(ContentItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PostPage {
            status,
            items,
            total,
            page_size,
            page_index,
            max_page,
        })
    }

    pub async fn count_by_status(&self, status: PostStatus) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        count_status(&mut conn, status).await
    }

    /// Counts for both statuses; unexpected stored values count as `New`.
    pub async fn stats(&self) -> Result<StatusCounts, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM posts GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match PostStatus::from_stored(&status) {
                PostStatus::New => counts.new += count,
                PostStatus::Used => counts.used += count,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};
    use wallpost_core::MediaList;

    async fn test_repo() -> (TempDir, PostRepository) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("posts.db").display());
        let repo = PostRepository::connect(&RepositoryConfig::new(url))
            .await
            .expect("connect");
        (dir, repo)
    }

    async fn raw_pool(dir: &TempDir) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("legacy.db"))
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("pool")
    }

    fn draft(item_key: &str, photos: usize) -> ContentDraft {
        let media = (0..photos)
            .map(|i| format!("https://cdn.example/{item_key}/{i}.jpg"))
            .collect::<Vec<_>>();
        ContentDraft::new(
            "-100",
            item_key,
            format!("post {item_key}"),
            MediaList::try_from(media).expect("media"),
        )
    }

    fn drafts(n: usize) -> Vec<ContentDraft> {
        (0..n).map(|i| draft(&format!("{i:03}"), 1)).collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_natural_key() {
        let (_dir, repo) = test_repo().await;
        let batch = drafts(3);

        assert_eq!(repo.upsert_many(&batch).await.expect("first"), 3);
        assert!(repo.set_status("-100_001", PostStatus::Used).await.expect("mark"));
        let before = repo.get("-100_001").await.expect("get").expect("row");

        assert_eq!(repo.upsert_many(&batch).await.expect("second"), 0);
        let after = repo.get("-100_001").await.expect("get").expect("row");

        assert_eq!(after.status, PostStatus::Used);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.used_at, before.used_at);
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(repo.stats().await.expect("stats"), StatusCounts { new: 2, used: 1 });
    }

    #[tokio::test]
    async fn reingestion_refreshes_content_in_order() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&[draft("7", 2)]).await.expect("insert");

        let mut changed = draft("7", 4);
        changed.text = "edited".to_string();
        assert_eq!(repo.upsert_many(&[changed.clone()]).await.expect("refresh"), 0);

        let item = repo.get("-100_7").await.expect("get").expect("row");
        assert_eq!(item.text, "edited");
        assert_eq!(item.media, changed.media.into_vec());
        assert_eq!(item.permalink, "https://vk.com/wall-100_7");
    }

    #[tokio::test]
    async fn claim_on_empty_pool_returns_none() {
        let (_dir, repo) = test_repo().await;
        assert!(repo.claim().await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn claim_marks_item_used_and_drains_pool() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&drafts(5)).await.expect("insert");

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let item = repo.claim().await.expect("claim").expect("item");
            assert_eq!(item.status, PostStatus::Used);
            assert!(item.used_at > 0);
            assert!(seen.insert(item.natural_key));
        }
        assert!(repo.claim().await.expect("claim").is_none());
        assert_eq!(repo.stats().await.expect("stats"), StatusCounts { new: 0, used: 5 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_single_item_once() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&drafts(1)).await.expect("insert");

        let handles = (0..8)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.claim().await })
            })
            .collect::<Vec<_>>();

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(item) = handle.await.expect("join").expect("claim") {
                winners.push(item.natural_key);
            }
        }
        assert_eq!(winners, vec!["-100_000".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_duplicate_items() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&drafts(20)).await.expect("insert");

        let handles = (0..20)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.claim().await })
            })
            .collect::<Vec<_>>();

        let mut keys = HashSet::new();
        for handle in handles {
            if let Some(item) = handle.await.expect("join").expect("claim") {
                assert!(keys.insert(item.natural_key), "item handed out twice");
            }
        }
        let stats = repo.stats().await.expect("stats");
        assert_eq!(stats.used as usize, keys.len());
        assert_eq!(stats.total(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_over_many_connections_never_fail() {
        let dir = tempdir().expect("tempdir");
        let mut config = RepositoryConfig::new(format!(
            "sqlite://{}",
            dir.path().join("posts.db").display()
        ));
        config.max_connections = 8;
        let repo = PostRepository::connect(&config).await.expect("connect");
        repo.upsert_many(&drafts(50)).await.expect("insert");

        let handles = (0..16)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.claim().await })
            })
            .collect::<Vec<_>>();

        let mut keys = HashSet::new();
        for handle in handles {
            let item = handle
                .await
                .expect("join")
                .expect("claim must not fail under contention")
                .expect("items remain for every caller");
            assert!(keys.insert(item.natural_key), "item handed out twice");
        }
        assert_eq!(keys.len(), 16);
        assert_eq!(repo.stats().await.expect("stats"), StatusCounts { new: 34, used: 16 });
    }

    #[tokio::test]
    async fn status_round_trip_stamps_and_clears_used_at() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&drafts(1)).await.expect("insert");

        assert!(repo.set_status("-100_000", PostStatus::Used).await.expect("used"));
        let used = repo.get("-100_000").await.expect("get").expect("row");
        assert_eq!(used.status, PostStatus::Used);
        assert!(used.used_at > 0);

        assert!(repo.release("-100_000").await.expect("release"));
        let fresh = repo.get("-100_000").await.expect("get").expect("row");
        assert_eq!(fresh.status, PostStatus::New);
        assert_eq!(fresh.used_at, 0);

        assert!(!repo.set_status("missing", PostStatus::Used).await.expect("missing"));
    }

    #[tokio::test]
    async fn set_status_to_current_value_refreshes_updated_at() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&drafts(1)).await.expect("insert");
        sqlx::query("UPDATE posts SET updated_at = 5 WHERE natural_key = '-100_000'")
            .execute(repo.pool())
            .await
            .expect("seed");

        assert!(repo.set_status("-100_000", PostStatus::New).await.expect("noop"));
        let item = repo.get("-100_000").await.expect("get").expect("row");
        assert_eq!(item.status, PostStatus::New);
        assert_eq!(item.used_at, 0);
        assert!(item.updated_at > 5);
    }

    #[tokio::test]
    async fn list_page_clamps_out_of_range_index() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&drafts(23)).await.expect("insert");

        let last = repo.list_page(PostStatus::New, 10, 2).await.expect("page 2");
        let clamped = repo.list_page(PostStatus::New, 10, 99).await.expect("page 99");

        assert_eq!(clamped, last);
        assert_eq!(clamped.page_index, 2);
        assert_eq!(clamped.max_page, 2);
        assert_eq!(clamped.total, 23);
        assert_eq!(clamped.items.len(), 3);

        let empty = repo.list_page(PostStatus::Used, 10, 5).await.expect("empty");
        assert_eq!(empty.page_index, 0);
        assert!(empty.items.is_empty());
    }

    #[tokio::test]
    async fn used_listing_is_newest_first() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&drafts(3)).await.expect("insert");
        for (key, used_at) in [("-100_000", 300), ("-100_001", 100), ("-100_002", 200)] {
            sqlx::query("UPDATE posts SET status = 'used', used_at = ? WHERE natural_key = ?")
                .bind(used_at)
                .bind(key)
                .execute(repo.pool())
                .await
                .expect("seed");
        }

        let page = repo.list_page(PostStatus::Used, 0, 0).await.expect("page");
        let keys: Vec<_> = page.items.iter().map(|i| i.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["-100_000", "-100_002", "-100_001"]);
        assert_eq!(page.page_size, DEFAULT_PAGE_SIZE);
    }

    #[tokio::test]
    async fn stats_fold_unexpected_status_into_new() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_many(&drafts(3)).await.expect("insert");
        for (key, status) in [("-100_000", "reserved"), ("-100_001", " used ")] {
            sqlx::query("UPDATE posts SET status = ? WHERE natural_key = ?")
                .bind(status)
                .bind(key)
                .execute(repo.pool())
                .await
                .expect("seed");
        }

        assert_eq!(repo.stats().await.expect("stats"), StatusCounts { new: 3, used: 0 });
        assert_eq!(repo.count_by_status(PostStatus::Used).await.expect("count"), 0);
        let item = repo.get("-100_000").await.expect("get").expect("row");
        assert_eq!(item.status, PostStatus::New);
        let padded = repo.get("-100_001").await.expect("get").expect("row");
        assert_eq!(padded.status, PostStatus::New);
    }

    #[tokio::test]
    async fn legacy_schema_is_upgraded_and_normalized_once() {
        let dir = tempdir().expect("tempdir");
        let pool = raw_pool(&dir).await;
        sqlx::query(
            r#"
            CREATE TABLE posts (
                natural_key TEXT PRIMARY KEY,
                owner_key   TEXT NOT NULL,
                item_key    TEXT NOT NULL,
                permalink   TEXT NOT NULL,
                text        TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'new',
                updated_at  INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await
        .expect("legacy table");
        for (key, status, updated_at) in [("a", "reserved", 10), ("b", "used", 500), ("c", "new", 20)] {
            sqlx::query(
                "INSERT INTO posts (natural_key, owner_key, item_key, permalink, text, status, updated_at) VALUES (?, '1', ?, '', '', ?, ?)",
            )
            .bind(key)
            .bind(key)
            .bind(status)
            .bind(updated_at)
            .execute(&pool)
            .await
            .expect("legacy row");
        }

        let first = SchemaManager::ensure(&pool).await.expect("first pass");
        assert!(!first.created_table);
        assert_eq!(first.added_columns, vec!["media_json", "created_at", "used_at"]);
        assert_eq!(first.normalized_statuses, 1);
        assert_eq!(first.backfilled_used_at, 1);

        let second = SchemaManager::ensure(&pool).await.expect("second pass");
        assert!(second.is_noop(), "second pass changed data: {second:?}");

        let repo = PostRepository::from_pool(pool).await.expect("repo");
        let used = repo.get("b").await.expect("get").expect("row");
        assert_eq!(used.used_at, 500);
        assert_eq!(repo.stats().await.expect("stats"), StatusCounts { new: 2, used: 1 });
    }

    #[tokio::test]
    async fn fresh_database_reports_created_table() {
        let dir = tempdir().expect("tempdir");
        let pool = raw_pool(&dir).await;
        let report = SchemaManager::ensure(&pool).await.expect("ensure");
        assert!(report.created_table);
        assert!(report.added_columns.is_empty());
        assert!(SchemaManager::ensure(&pool).await.expect("again").is_noop());
    }
}
