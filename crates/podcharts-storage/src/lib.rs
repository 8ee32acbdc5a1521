//! SQLite chart store + HTTP fetch utilities for podcharts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use podcharts_core::{Cell, ChartEntry, Podcast, Table};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Column, Executor, Row, Statement, TypeInfo, ValueRef};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "podcharts-storage";

const SCHEMA_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS Top100Lists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        platform TEXT NOT NULL,
        rank INTEGER NOT NULL,
        title TEXT,
        platform_podcast_id TEXT,
        date TEXT NOT NULL,
        UNIQUE(platform, rank, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS Podcasts (
        podcast_id INTEGER PRIMARY KEY,
        title TEXT,
        description TEXT,
        feed_url TEXT,
        image_url TEXT,
        episode_count INTEGER,
        avg_duration_last_10 INTEGER,
        latest_episode_title TEXT,
        last_update_time INTEGER,
        podcast_guid TEXT,
        original_url TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS Categories (
        category_id INTEGER PRIMARY KEY,
        category_name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS PodcastCategories (
        podcast_id INTEGER NOT NULL,
        category_id INTEGER NOT NULL,
        PRIMARY KEY (podcast_id, category_id),
        FOREIGN KEY (podcast_id) REFERENCES Podcasts(podcast_id) ON DELETE CASCADE,
        FOREIGN KEY (category_id) REFERENCES Categories(category_id) ON DELETE CASCADE
    )
    "#,
];

// Views read by the spreadsheet publisher. Chart rows link to podcasts by title only.
const SCHEMA_VIEWS: &[&str] = &[
    r#"
    CREATE VIEW IF NOT EXISTS vw_CurrentPodcastDetailsWithCategories AS
    WITH latest AS (
        SELECT platform, MAX(date) AS date FROM Top100Lists GROUP BY platform
    )
    SELECT t.platform,
           t.rank,
           t.title,
           t.date,
           p.podcast_id,
           p.description,
           p.feed_url,
           p.image_url,
           p.episode_count,
           p.avg_duration_last_10,
           p.latest_episode_title,
           p.last_update_time,
           (SELECT GROUP_CONCAT(c.category_name, ', ')
              FROM PodcastCategories pc
              JOIN Categories c ON c.category_id = pc.category_id
             WHERE pc.podcast_id = p.podcast_id) AS categories
      FROM Top100Lists t
      JOIN latest l ON l.platform = t.platform AND l.date = t.date
      LEFT JOIN Podcasts p ON LOWER(TRIM(p.title)) = LOWER(TRIM(t.title))
     ORDER BY t.platform, t.rank
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS vw_NewEntries AS
    WITH chart_dates AS (
        SELECT DISTINCT platform, date FROM Top100Lists
    ),
    numbered AS (
        SELECT platform, date,
               ROW_NUMBER() OVER (PARTITION BY platform ORDER BY date DESC) AS n
          FROM chart_dates
    )
    SELECT t.platform, t.rank, t.title, t.date
      FROM Top100Lists t
      JOIN numbered latest ON latest.platform = t.platform AND latest.date = t.date AND latest.n = 1
     WHERE t.title IS NOT NULL
       AND NOT EXISTS (
           SELECT 1
             FROM Top100Lists prev
             JOIN numbered pd ON pd.platform = prev.platform AND pd.date = prev.date AND pd.n = 2
            WHERE prev.platform = t.platform AND prev.title = t.title
       )
     ORDER BY t.platform, t.rank
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS vw_PlatformOverlap AS
    WITH latest AS (
        SELECT platform, MAX(date) AS date FROM Top100Lists GROUP BY platform
    ),
    latest_chart AS (
        SELECT t.platform, t.rank, t.title
          FROM Top100Lists t
          JOIN latest l ON l.platform = t.platform AND l.date = t.date
         WHERE t.title IS NOT NULL AND t.title != ''
    )
    SELECT a.title AS title,
           a.rank AS apple_rank,
           s.rank AS spotify_rank
      FROM latest_chart a
      JOIN latest_chart s ON LOWER(TRIM(a.title)) = LOWER(TRIM(s.title))
     WHERE a.platform = 'Apple' AND s.platform = 'Spotify'
     ORDER BY a.rank
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS vw_RankChanges AS
    WITH chart_dates AS (
        SELECT DISTINCT platform, date FROM Top100Lists
    ),
    numbered AS (
        SELECT platform, date,
               ROW_NUMBER() OVER (PARTITION BY platform ORDER BY date DESC) AS n
          FROM chart_dates
    ),
    latest_chart AS (
        SELECT t.platform, t.title, t.rank, t.date
          FROM Top100Lists t
          JOIN numbered d ON d.platform = t.platform AND d.date = t.date AND d.n = 1
         WHERE t.title IS NOT NULL
    ),
    previous_chart AS (
        SELECT t.platform, t.title, t.rank
          FROM Top100Lists t
          JOIN numbered d ON d.platform = t.platform AND d.date = t.date AND d.n = 2
         WHERE t.title IS NOT NULL
    )
    SELECT c.platform,
           c.title,
           c.date,
           p.rank AS previous_rank,
           c.rank AS current_rank,
           CASE WHEN p.rank IS NULL THEN NULL ELSE p.rank - c.rank END AS rank_change
      FROM latest_chart c
      LEFT JOIN previous_chart p ON p.platform = c.platform AND p.title = c.title
     ORDER BY c.platform, c.rank
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS vw_TimeOnList AS
    SELECT platform,
           title,
           COUNT(DISTINCT date) AS days_on_list,
           MIN(date) AS first_seen,
           MAX(date) AS last_seen,
           MIN(rank) AS best_rank
      FROM Top100Lists
     WHERE title IS NOT NULL AND title != ''
     GROUP BY platform, title
     ORDER BY platform, days_on_list DESC, best_rank
    "#,
];

/// Outcome of one chart batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChartWriteSummary {
    pub inserted: usize,
    pub ignored: usize,
    pub failed: usize,
}

/// Outcome of one podcast upsert transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodcastWriteOutcome {
    pub linked_categories: usize,
    pub skipped_categories: usize,
}

#[derive(Debug, Clone)]
pub struct ChartStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl ChartStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening database {}", path.display()))?;

        let store = Self { pool, path };
        store.ensure_schema().await?;
        info!(path = %store.path.display(), "chart store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create tables and views that do not exist yet.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for ddl in SCHEMA_TABLES.iter().chain(SCHEMA_VIEWS) {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("applying schema")?;
        }
        Ok(())
    }

    /// Drop and recreate `Podcasts` and `PodcastCategories` for a fresh snapshot.
    pub async fn rebuild_detail_tables(&self) -> anyhow::Result<()> {
        sqlx::query("DROP TABLE IF EXISTS PodcastCategories")
            .execute(&self.pool)
            .await
            .context("dropping PodcastCategories")?;
        sqlx::query("DROP TABLE IF EXISTS Podcasts")
            .execute(&self.pool)
            .await
            .context("dropping Podcasts")?;
        info!("dropped Podcasts and PodcastCategories");
        self.ensure_schema().await
    }

    /// Insert chart rows, ignoring any that already exist for (platform, rank, date).
    pub async fn write_chart_entries(
        &self,
        entries: &[ChartEntry],
    ) -> anyhow::Result<ChartWriteSummary> {
        let mut summary = ChartWriteSummary::default();
        let Some(first) = entries.first() else {
            warn!("no chart records provided to save");
            return Ok(summary);
        };
        let platform = first.platform;

        let mut tx = self.pool.begin().await.context("beginning chart transaction")?;
        for entry in entries {
            if let Err(reason) = entry.validate() {
                error!(%reason, ?entry, "chart record missing required fields; skipping");
                summary.failed += 1;
                continue;
            }
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO Top100Lists (platform, rank, title, platform_podcast_id, date)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.platform.as_str())
            .bind(i64::from(entry.rank))
            .bind(entry.title.as_deref())
            .bind(entry.platform_podcast_id.as_deref())
            .bind(entry.date_string())
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => summary.inserted += 1,
                Ok(_) => summary.ignored += 1,
                Err(err) => {
                    error!(error = %err, ?entry, "failed to insert chart record");
                    summary.failed += 1;
                }
            }
        }
        tx.commit().await.context("committing chart records")?;

        info!(
            %platform,
            inserted = summary.inserted,
            ignored = summary.ignored,
            failed = summary.failed,
            path = %self.path.display(),
            "chart records saved"
        );
        Ok(summary)
    }

    /// Distinct non-empty chart titles, the input of the detail update.
    pub async fn distinct_titles(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT title FROM Top100Lists WHERE title IS NOT NULL AND title != '' ORDER BY title",
        )
        .fetch_all(&self.pool)
        .await
        .context("reading titles from Top100Lists")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("title").map_err(Into::into))
            .collect()
    }

    pub async fn chart_row_count(&self) -> anyhow::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM Top100Lists")
            .fetch_one(&self.pool)
            .await
            .context("counting chart rows")
    }

    /// Replace one podcast row and its category links in a single transaction.
    ///
    /// Category ids that are not integers are skipped with a warning, and a
    /// category whose link insert fails is logged and counted. Only a failure on
    /// the podcast row or the link cleanup rolls the podcast back.
    pub async fn upsert_podcast(&self, podcast: &Podcast) -> anyhow::Result<PodcastWriteOutcome> {
        let mut outcome = PodcastWriteOutcome::default();
        let mut tx = self.pool.begin().await.context("beginning podcast transaction")?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO Podcasts
                (podcast_id, title, description, feed_url, image_url, episode_count,
                 avg_duration_last_10, latest_episode_title, last_update_time,
                 podcast_guid, original_url)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(podcast.podcast_id)
        .bind(podcast.title.as_deref())
        .bind(podcast.description.as_deref())
        .bind(podcast.feed_url.as_deref())
        .bind(podcast.image_url.as_deref())
        .bind(podcast.episode_count)
        .bind(podcast.avg_duration_last_10)
        .bind(podcast.latest_episode_title.as_deref())
        .bind(podcast.last_update_time)
        .bind(podcast.podcast_guid.as_deref())
        .bind(podcast.original_url.as_deref())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("replacing podcast {}", podcast.podcast_id))?;

        let removed = sqlx::query("DELETE FROM PodcastCategories WHERE podcast_id = ?")
            .bind(podcast.podcast_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clearing categories of podcast {}", podcast.podcast_id))?;
        debug!(
            podcast_id = podcast.podcast_id,
            removed = removed.rows_affected(),
            "cleared category links"
        );

        for (raw_id, name) in &podcast.categories {
            if raw_id.trim().is_empty() || name.trim().is_empty() {
                warn!(
                    podcast_id = podcast.podcast_id,
                    category_id = %raw_id,
                    "empty category id or name; skipping category link"
                );
                outcome.skipped_categories += 1;
                continue;
            }
            let Ok(category_id) = raw_id.trim().parse::<i64>() else {
                warn!(
                    podcast_id = podcast.podcast_id,
                    category_id = %raw_id,
                    "invalid category id; skipping category link"
                );
                outcome.skipped_categories += 1;
                continue;
            };
            let linked = async {
                sqlx::query(
                    "INSERT OR IGNORE INTO Categories (category_id, category_name) VALUES (?, ?)",
                )
                .bind(category_id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT OR IGNORE INTO PodcastCategories (podcast_id, category_id) VALUES (?, ?)",
                )
                .bind(podcast.podcast_id)
                .bind(category_id)
                .execute(&mut *tx)
                .await?;
                Ok::<_, sqlx::Error>(())
            }
            .await;
            if let Err(err) = linked {
                error!(
                    podcast_id = podcast.podcast_id,
                    category_id,
                    category_name = %name,
                    error = %err,
                    "failed to link category; keeping podcast"
                );
                outcome.skipped_categories += 1;
                continue;
            }
            outcome.linked_categories += 1;
        }

        tx.commit()
            .await
            .with_context(|| format!("committing podcast {}", podcast.podcast_id))?;
        Ok(outcome)
    }

    pub async fn podcast_category_ids(&self, podcast_id: i64) -> anyhow::Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT category_id FROM PodcastCategories WHERE podcast_id = ? ORDER BY category_id",
        )
        .bind(podcast_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("reading categories of podcast {podcast_id}"))
    }

    /// Run an arbitrary read query and return its header and cells.
    ///
    /// NULL values come back as [`Cell::Empty`]; non-finite floats do too.
    pub async fn query_table(&self, sql: &str) -> anyhow::Result<Table> {
        let statement = (&self.pool)
            .prepare(sql)
            .await
            .with_context(|| format!("preparing query {sql}"))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = statement
            .query()
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("running query {sql}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut cells = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                cells.push(read_cell(row, index)?);
            }
            out.push(cells);
        }
        Ok(Table { columns, rows: out })
    }
}

fn read_cell(row: &sqlx::sqlite::SqliteRow, index: usize) -> anyhow::Result<Cell> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Cell::Empty);
    }
    let type_name = raw.type_info().name().to_string();
    let cell = match type_name.as_str() {
        "INTEGER" => Cell::Int(row.try_get::<i64, _>(index)?),
        "REAL" => Cell::from_f64(row.try_get::<f64, _>(index)?),
        _ => match row.try_get::<String, _>(index) {
            Ok(text) => Cell::Text(text),
            Err(err) => {
                warn!(
                    column = index,
                    sqlite_type = %type_name,
                    error = %err,
                    "value cannot be published as text; writing a blank cell"
                );
                Cell::Empty
            }
        },
    };
    Ok(cell)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
        }
    }
}

/// Single-attempt HTTP client. Failed calls are not retried; the next scheduled
/// run picks them up.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Leading part of the body for log lines.
    pub fn snippet(&self, max_chars: usize) -> String {
        String::from_utf8_lossy(&self.body)
            .chars()
            .take(max_chars)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One GET request: target URL plus optional query pairs and headers.
#[derive(Debug, Clone, Default)]
pub struct GetRequest<'a> {
    pub url: &'a str,
    pub query: Vec<(&'a str, String)>,
    pub headers: Vec<(&'static str, String)>,
}

impl<'a> GetRequest<'a> {
    pub fn new(url: &'a str) -> Self {
        Self {
            url,
            ..Default::default()
        }
    }

    pub fn query(mut self, key: &'a str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    pub fn header(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((key, value.into()));
        self
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.get(run_id, source_id, GetRequest::new(url)).await
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: GetRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = request.url);
        async move {
            let mut builder = self.client.get(request.url);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            for (key, value) in &request.headers {
                builder = builder.header(*key, value);
            }

            let resp = builder.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            info!(status = status.as_u16(), "http response");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use httpmock::prelude::*;
    use podcharts_core::Platform;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn entry(platform: Platform, rank: u32, title: &str, date: &str) -> ChartEntry {
        ChartEntry {
            platform,
            rank,
            title: Some(title.to_string()),
            platform_podcast_id: Some(format!("id-{rank}")),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        }
    }

    fn podcast(id: i64, title: &str, categories: &[(&str, &str)]) -> Podcast {
        Podcast {
            podcast_id: id,
            title: Some(title.to_string()),
            categories: categories
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> ChartStore {
        ChartStore::open(dir.path().join("data").join("podcasts.db"))
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn open_creates_parent_directory_and_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        assert!(dir.path().join("data").join("podcasts.db").exists());
        store.ensure_schema().await.expect("second schema pass");
        assert_eq!(store.chart_row_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_platform_rank_date_is_ignored() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;

        let first = store
            .write_chart_entries(&[entry(Platform::Apple, 1, "The Daily", "2025-03-01")])
            .await
            .unwrap();
        assert_eq!(first, ChartWriteSummary { inserted: 1, ignored: 0, failed: 0 });

        let second = store
            .write_chart_entries(&[entry(Platform::Apple, 1, "Different Show", "2025-03-01")])
            .await
            .unwrap();
        assert_eq!(second, ChartWriteSummary { inserted: 0, ignored: 1, failed: 0 });

        assert_eq!(store.chart_row_count().await.unwrap(), 1);
        assert_eq!(store.distinct_titles().await.unwrap(), vec!["The Daily".to_string()]);
    }

    #[tokio::test]
    async fn invalid_record_is_skipped_without_aborting_batch() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let summary = store
            .write_chart_entries(&[
                entry(Platform::Spotify, 0, "No Rank", "2025-03-01"),
                entry(Platform::Spotify, 2, "Ranked", "2025-03-01"),
            ])
            .await
            .unwrap();
        assert_eq!(summary, ChartWriteSummary { inserted: 1, ignored: 0, failed: 1 });
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let summary = store.write_chart_entries(&[]).await.unwrap();
        assert_eq!(summary, ChartWriteSummary::default());
    }

    #[tokio::test]
    async fn rewriting_podcast_replaces_category_set() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;

        store
            .upsert_podcast(&podcast(42, "The Daily", &[("55", "News"), ("59", "Politics")]))
            .await
            .unwrap();
        assert_eq!(store.podcast_category_ids(42).await.unwrap(), vec![55, 59]);

        let outcome = store
            .upsert_podcast(&podcast(42, "The Daily", &[("59", "Politics"), ("77", "Daily News")]))
            .await
            .unwrap();
        assert_eq!(outcome.linked_categories, 2);
        assert_eq!(store.podcast_category_ids(42).await.unwrap(), vec![59, 77]);
    }

    #[tokio::test]
    async fn malformed_category_ids_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let outcome = store
            .upsert_podcast(&podcast(7, "Show", &[("abc", "Broken"), ("12", "Comedy")]))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PodcastWriteOutcome { linked_categories: 1, skipped_categories: 1 }
        );
        assert_eq!(store.podcast_category_ids(7).await.unwrap(), vec![12]);
    }

    #[tokio::test]
    async fn conflicting_category_name_keeps_podcast_row() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store
            .upsert_podcast(&podcast(1, "First", &[("55", "News")]))
            .await
            .unwrap();

        // "News" already exists as 55, so the link to 66 has no Categories row.
        let outcome = store
            .upsert_podcast(&podcast(2, "Second", &[("66", "News"), ("12", "Comedy")]))
            .await
            .expect("podcast survives a failed category link");
        assert_eq!(
            outcome,
            PodcastWriteOutcome { linked_categories: 1, skipped_categories: 1 }
        );
        assert_eq!(store.podcast_category_ids(2).await.unwrap(), vec![12]);
        assert_eq!(store.podcast_category_ids(1).await.unwrap(), vec![55]);

        let table = store
            .query_table("SELECT podcast_id, title FROM Podcasts WHERE podcast_id = 2")
            .await
            .unwrap();
        assert_eq!(table.rows, vec![vec![Cell::Int(2), Cell::Text("Second".into())]]);
    }

    #[tokio::test]
    async fn rebuild_clears_podcast_rows_but_keeps_charts() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store
            .write_chart_entries(&[entry(Platform::Apple, 1, "The Daily", "2025-03-01")])
            .await
            .unwrap();
        store
            .upsert_podcast(&podcast(42, "The Daily", &[("55", "News")]))
            .await
            .unwrap();

        store.rebuild_detail_tables().await.unwrap();

        assert!(store.podcast_category_ids(42).await.unwrap().is_empty());
        let table = store.query_table("SELECT * FROM Podcasts").await.unwrap();
        assert!(table.rows.is_empty());
        assert_eq!(table.columns[0], "podcast_id");
        assert_eq!(store.chart_row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_table_maps_nulls_and_nan_to_empty() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let table = store
            .query_table("SELECT 1 AS a, NULL AS b, 'x' AS c, 2.5 AS d")
            .await
            .unwrap();
        assert_eq!(table.columns, vec!["a", "b", "c", "d"]);
        assert_eq!(
            table.rows,
            vec![vec![
                Cell::Int(1),
                Cell::Empty,
                Cell::Text("x".into()),
                Cell::Float(2.5)
            ]]
        );
    }

    #[tokio::test]
    async fn blob_values_publish_as_blank() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let table = store
            .query_table("SELECT X'00FFFE' AS raw, 'kept' AS label")
            .await
            .unwrap();
        assert_eq!(
            table.rows,
            vec![vec![Cell::Empty, Cell::Text("kept".into())]]
        );
    }

    #[tokio::test]
    async fn current_details_view_joins_latest_chart_with_categories() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store
            .write_chart_entries(&[
                entry(Platform::Apple, 1, "Old Favourite", "2025-03-01"),
                entry(Platform::Apple, 1, "The Daily", "2025-03-02"),
                entry(Platform::Apple, 2, "Old Favourite", "2025-03-02"),
            ])
            .await
            .unwrap();
        store
            .upsert_podcast(&podcast(42, "the daily", &[("55", "News")]))
            .await
            .unwrap();

        let table = store
            .query_table("SELECT title, podcast_id, categories FROM vw_CurrentPodcastDetailsWithCategories")
            .await
            .unwrap();
        assert_eq!(
            table.rows,
            vec![
                vec![Cell::Text("The Daily".into()), Cell::Int(42), Cell::Text("News".into())],
                vec![Cell::Text("Old Favourite".into()), Cell::Empty, Cell::Empty],
            ]
        );

        let new_entries = store
            .query_table("SELECT title FROM vw_NewEntries")
            .await
            .unwrap();
        assert_eq!(new_entries.rows, vec![vec![Cell::Text("The Daily".into())]]);

        let changes = store
            .query_table("SELECT title, previous_rank, current_rank, rank_change FROM vw_RankChanges WHERE title = 'Old Favourite'")
            .await
            .unwrap();
        assert_eq!(
            changes.rows,
            vec![vec![
                Cell::Text("Old Favourite".into()),
                Cell::Int(1),
                Cell::Int(2),
                Cell::Int(-1)
            ]]
        );
    }

    #[tokio::test]
    async fn overlap_and_time_on_list_views() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store
            .write_chart_entries(&[
                entry(Platform::Apple, 3, "Shared Show", "2025-03-01"),
                entry(Platform::Apple, 3, "Shared Show", "2025-03-02"),
            ])
            .await
            .unwrap();
        store
            .write_chart_entries(&[entry(Platform::Spotify, 5, "shared show ", "2025-03-02")])
            .await
            .unwrap();

        let overlap = store
            .query_table("SELECT apple_rank, spotify_rank FROM vw_PlatformOverlap")
            .await
            .unwrap();
        assert_eq!(overlap.rows, vec![vec![Cell::Int(3), Cell::Int(5)]]);

        let time_on_list = store
            .query_table("SELECT days_on_list FROM vw_TimeOnList WHERE platform = 'Apple'")
            .await
            .unwrap();
        assert_eq!(time_on_list.rows, vec![vec![Cell::Int(2)]]);
    }

    #[tokio::test]
    async fn fetcher_reports_non_success_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404).body("nope");
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher
            .fetch_bytes(Uuid::new_v4(), "test", &server.url("/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn fetcher_sends_query_and_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/search")
                    .query_param("q", "The Daily")
                    .header("X-Auth-Key", "key");
                then.status(200).json_body(serde_json::json!({"ok": true}));
            })
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let url = server.url("/search");
        let resp = fetcher
            .get(
                Uuid::new_v4(),
                "test",
                GetRequest::new(&url)
                    .query("q", "The Daily")
                    .header("X-Auth-Key", "key"),
            )
            .await
            .unwrap();
        mock.assert_async().await;
        let body: serde_json::Value = resp.json().unwrap();
        assert_eq!(body["ok"], true);
    }
}
