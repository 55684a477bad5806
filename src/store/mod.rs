//! Durable dedupe state and listing archive, backed by SQLite.
//!
//! Two tables share the key `(profile_name, url)`:
//! - `seen_listings` decides novelty for a profile
//! - `listings` keeps the latest observed fields of every listing
//!
//! Listings without a url are never written. Every write call runs in a
//! single transaction and stamps all of its rows with the same second.

pub mod normalize;

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{ArchivedListing, Listing, SeenRecord};
use normalize::{coerce_rooms, parse_price};

/// Upper bound of urls bound into one `IN (...)` lookup
const LOOKUP_BATCH: usize = 500;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const CREATE_SEEN_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS seen_listings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        profile_name TEXT NOT NULL,
        url TEXT NOT NULL,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        UNIQUE(profile_name, url)
    )
"#;

const CREATE_LISTINGS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS listings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        profile_name TEXT NOT NULL,
        url TEXT NOT NULL,
        title TEXT,
        price_amount REAL,
        price_currency TEXT,
        location TEXT,
        rooms REAL,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        UNIQUE(profile_name, url)
    )
"#;

const CREATE_LISTINGS_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_listings_profile_lastseen
        ON listings(profile_name, last_seen_at DESC)
"#;

const UPSERT_SEEN: &str = r#"
    INSERT INTO seen_listings (profile_name, url, first_seen_at, last_seen_at)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(profile_name, url)
    DO UPDATE SET last_seen_at = excluded.last_seen_at
"#;

const UPSERT_LISTING: &str = r#"
    INSERT INTO listings (
        profile_name, url, title, price_amount, price_currency,
        location, rooms, first_seen_at, last_seen_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(profile_name, url) DO UPDATE SET
        title = excluded.title,
        price_amount = excluded.price_amount,
        price_currency = excluded.price_currency,
        location = excluded.location,
        rooms = excluded.rooms,
        last_seen_at = excluded.last_seen_at
"#;

/// Current UTC time truncated to whole seconds
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(column: &'static str, value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp { column, value })
}

#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!("Opened listing store at {}", path.display());
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if absent. Safe to call on every start.
    pub async fn init(&self) -> Result<(), StoreError> {
        for statement in [CREATE_SEEN_TABLE, CREATE_LISTINGS_TABLE, CREATE_LISTINGS_INDEX] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Listings whose url hasn't been seen for `profile_name`, in input order.
    /// Listings without a url can't be looked up and are always returned.
    pub async fn filter_unseen(
        &self,
        profile_name: &str,
        listings: &[Listing],
    ) -> Result<Vec<Listing>, StoreError> {
        if listings.is_empty() {
            return Ok(Vec::new());
        }

        let urls: Vec<&str> = listings
            .iter()
            .filter(|l| l.has_identity())
            .map(|l| l.url.as_str())
            .collect();

        let mut seen = HashSet::new();
        for chunk in urls.chunks(LOOKUP_BATCH) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT url FROM seen_listings WHERE profile_name = ");
            query.push_bind(profile_name);
            query.push(" AND url IN (");
            let mut values = query.separated(", ");
            for url in chunk {
                values.push_bind(*url);
            }
            values.push_unseparated(")");

            for row in query.build().fetch_all(&self.pool).await? {
                seen.insert(row.try_get::<String, _>("url")?);
            }
        }

        debug!(
            "{}: {} of {} urls already seen",
            profile_name,
            seen.len(),
            urls.len()
        );

        Ok(listings
            .iter()
            .filter(|l| !l.has_identity() || !seen.contains(&l.url))
            .cloned()
            .collect())
    }

    /// Record the listings as seen now
    pub async fn mark_seen(
        &self,
        profile_name: &str,
        listings: &[Listing],
    ) -> Result<usize, StoreError> {
        self.mark_seen_at(profile_name, listings, now_utc()).await
    }

    /// Record the listings as seen at `at`. `first_seen_at` is only written
    /// when the row is created.
    pub async fn mark_seen_at(
        &self,
        profile_name: &str,
        listings: &[Listing],
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let keyed: Vec<&Listing> = listings.iter().filter(|l| l.has_identity()).collect();
        if keyed.is_empty() {
            return Ok(0);
        }

        let stamp = format_timestamp(at);
        let mut tx = self.pool.begin().await?;
        for listing in &keyed {
            sqlx::query(UPSERT_SEEN)
                .bind(profile_name)
                .bind(&listing.url)
                .bind(&stamp)
                .bind(&stamp)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("{}: marked {} listings seen", profile_name, keyed.len());
        Ok(keyed.len())
    }

    /// Archive the listings' latest fields as of now
    pub async fn archive(
        &self,
        profile_name: &str,
        listings: &[Listing],
    ) -> Result<usize, StoreError> {
        self.archive_at(profile_name, listings, now_utc()).await
    }

    pub async fn archive_at(
        &self,
        profile_name: &str,
        listings: &[Listing],
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let keyed: Vec<&Listing> = listings.iter().filter(|l| l.has_identity()).collect();
        if keyed.is_empty() {
            return Ok(0);
        }

        let stamp = format_timestamp(at);
        let mut tx = self.pool.begin().await?;
        for listing in &keyed {
            let (price_amount, price_currency) = parse_price(listing.price.as_ref());
            let rooms = coerce_rooms(listing.rooms.as_ref());

            sqlx::query(UPSERT_LISTING)
                .bind(profile_name)
                .bind(&listing.url)
                .bind(listing.title.as_deref())
                .bind(price_amount)
                .bind(price_currency)
                .bind(listing.location.as_deref())
                .bind(rooms)
                .bind(&stamp)
                .bind(&stamp)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("{}: archived {} listings", profile_name, keyed.len());
        Ok(keyed.len())
    }

    /// Most recently observed archived listings of a profile
    pub async fn recent(
        &self,
        profile_name: &str,
        limit: u32,
    ) -> Result<Vec<ArchivedListing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT profile_name, url, title, price_amount, price_currency,
                   location, rooms, first_seen_at, last_seen_at
            FROM listings
            WHERE profile_name = ?
            ORDER BY last_seen_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(profile_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_archived).collect()
    }

    pub async fn seen_record(
        &self,
        profile_name: &str,
        url: &str,
    ) -> Result<Option<SeenRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT profile_name, url, first_seen_at, last_seen_at
            FROM seen_listings
            WHERE profile_name = ? AND url = ?
            "#,
        )
        .bind(profile_name)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<SeenRecord, StoreError> {
            Ok(SeenRecord {
                profile_name: row.try_get("profile_name")?,
                url: row.try_get("url")?,
                first_seen_at: parse_timestamp("first_seen_at", row.try_get("first_seen_at")?)?,
                last_seen_at: parse_timestamp("last_seen_at", row.try_get("last_seen_at")?)?,
            })
        })
        .transpose()
    }

    pub async fn archived_count(&self, profile_name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM listings WHERE profile_name = ?")
            .bind(profile_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    fn row_to_archived(row: &SqliteRow) -> Result<ArchivedListing, StoreError> {
        Ok(ArchivedListing {
            profile_name: row.try_get("profile_name")?,
            url: row.try_get("url")?,
            title: row.try_get("title")?,
            price_amount: row.try_get("price_amount")?,
            price_currency: row.try_get("price_currency")?,
            location: row.try_get("location")?,
            rooms: row.try_get("rooms")?,
            first_seen_at: parse_timestamp("first_seen_at", row.try_get("first_seen_at")?)?,
            last_seen_at: parse_timestamp("last_seen_at", row.try_get("last_seen_at")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::{tempdir, TempDir};

    async fn open_store() -> (TempDir, ListingStore) {
        let dir = tempdir().unwrap();
        let store = ListingStore::open(dir.path().join("data").join("dedupe.sqlite3"))
            .await
            .unwrap();
        store.init().await.unwrap();
        (dir, store)
    }

    fn listing(url: &str) -> Listing {
        Listing::new(url)
            .with_title(format!("Wohnung {}", url))
            .with_price("CHF 2'400.–")
            .with_rooms("3,5")
            .with_location("Zürich")
    }

    fn urls(listings: &[Listing]) -> Vec<&str> {
        listings.iter().map(|l| l.url.as_str()).collect()
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (_dir, store) = open_store().await;
        store.init().await.unwrap();
        store.init().await.unwrap();
        assert_eq!(store.archived_count("p").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn filter_unseen_preserves_order_and_is_repeatable() {
        let (_dir, store) = open_store().await;
        store.mark_seen("p", &[listing("b")]).await.unwrap();

        let input = vec![listing("c"), listing("b"), listing("a"), listing("d")];
        let first = store.filter_unseen("p", &input).await.unwrap();
        let second = store.filter_unseen("p", &input).await.unwrap();

        assert_eq!(urls(&first), vec!["c", "a", "d"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn seen_listings_are_not_new_again() {
        let (_dir, store) = open_store().await;
        let batch = vec![listing("a"), listing("b")];

        store.mark_seen("p", &batch).await.unwrap();

        assert!(store.filter_unseen("p", &batch).await.unwrap().is_empty());
        // other profiles keep their own partition
        assert_eq!(store.filter_unseen("q", &batch).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_seen_keeps_first_seen_and_advances_last_seen() {
        let (_dir, store) = open_store().await;
        let t1 = Utc.with_ymd_and_hms(2025, 9, 12, 14, 32, 5).unwrap();
        let t2 = t1 + Duration::hours(6);

        store.mark_seen_at("p", &[listing("a")], t1).await.unwrap();
        store.mark_seen_at("p", &[listing("a")], t2).await.unwrap();

        let record = store.seen_record("p", "a").await.unwrap().unwrap();
        assert_eq!(record.first_seen_at, t1);
        assert_eq!(record.last_seen_at, t2);
    }

    #[tokio::test]
    async fn archive_overwrites_fields_but_not_first_seen() {
        let (_dir, store) = open_store().await;
        let t1 = Utc.with_ymd_and_hms(2025, 9, 12, 8, 0, 0).unwrap();
        let t2 = t1 + Duration::days(1);

        store.archive_at("p", &[listing("a")], t1).await.unwrap();
        let updated = Listing::new("a").with_title("Neu").with_price(2300.0).with_rooms(4.0);
        store.archive_at("p", &[updated], t2).await.unwrap();

        let rows = store.recent("p", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.title.as_deref(), Some("Neu"));
        assert_eq!(row.price_amount, Some(2300.0));
        assert_eq!(row.price_currency, None);
        assert_eq!(row.location, None);
        assert_eq!(row.rooms, Some(4.0));
        assert_eq!(row.first_seen_at, t1);
        assert_eq!(row.last_seen_at, t2);
    }

    #[tokio::test]
    async fn archive_normalizes_price_and_rooms() {
        let (_dir, store) = open_store().await;
        store.archive("p", &[listing("a")]).await.unwrap();

        let row = &store.recent("p", 1).await.unwrap()[0];
        assert_eq!(row.price_amount, Some(2400.0));
        assert_eq!(row.price_currency.as_deref(), Some("CHF"));
        assert_eq!(row.rooms, Some(3.5));
    }

    #[tokio::test]
    async fn listings_without_url_are_skipped_not_fatal() {
        let (_dir, store) = open_store().await;
        let batch = vec![listing("a"), listing(""), listing("  "), listing("b")];

        assert_eq!(store.archive("p", &batch).await.unwrap(), 2);
        assert_eq!(store.mark_seen("p", &batch).await.unwrap(), 2);
        assert_eq!(store.archived_count("p").await.unwrap(), 2);

        // still passed through as new, since they can't be looked up
        let fresh = store.filter_unseen("p", &batch).await.unwrap();
        assert_eq!(urls(&fresh), vec!["", "  "]);
    }

    #[tokio::test]
    async fn recent_orders_by_last_seen_and_caps() {
        let (_dir, store) = open_store().await;
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        store.archive_at("p", &[listing("old")], base).await.unwrap();
        store
            .archive_at("p", &[listing("mid")], base + Duration::hours(1))
            .await
            .unwrap();
        store
            .archive_at("p", &[listing("new")], base + Duration::hours(2))
            .await
            .unwrap();
        store.archive_at("other", &[listing("x")], base).await.unwrap();

        let recent = store.recent("p", 2).await.unwrap();
        let recent_urls: Vec<&str> = recent.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(recent_urls, vec!["new", "mid"]);
    }

    #[tokio::test]
    async fn lookup_spans_multiple_batches() {
        let (_dir, store) = open_store().await;
        let many: Vec<Listing> = (0..1200).map(|i| Listing::new(format!("u{}", i))).collect();

        store.mark_seen("p", &many[..1100]).await.unwrap();
        let fresh = store.filter_unseen("p", &many).await.unwrap();

        assert_eq!(fresh.len(), 100);
        assert_eq!(fresh[0].url, "u1100");
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dedupe.sqlite3");
        {
            let store = ListingStore::open(&path).await.unwrap();
            store.init().await.unwrap();
            store.mark_seen("p", &[listing("a")]).await.unwrap();
            store.pool().close().await;
        }

        let store = ListingStore::open(&path).await.unwrap();
        store.init().await.unwrap();
        assert!(store.filter_unseen("p", &[listing("a")]).await.unwrap().is_empty());
    }
}
