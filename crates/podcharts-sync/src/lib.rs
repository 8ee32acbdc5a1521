//! Pipeline orchestration: configuration, chart snapshots, detail enrichment and publishing.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use podcharts_adapters::resolver::{resolve_title, DEFAULT_MATCH_THRESHOLD};
use podcharts_adapters::{
    adapter_for_platform, AdapterContext, ChartRequest, DirectoryClient, DirectoryConfig,
    DEFAULT_APPLE_URL_TEMPLATE, DEFAULT_SPOTIFY_URL,
};
use podcharts_core::Platform;
use podcharts_sheets::{load_targets, publish_views, GoogleSheetsClient, SheetsConfig};
use podcharts_storage::{ChartStore, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use podcharts_sheets::PublishSummary;

pub const CRATE_NAME: &str = "podcharts-sync";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct ChartsConfig {
    pub region: String,
    pub limit: usize,
    pub apple_url_template: String,
    pub spotify_url: String,
}

/// Directory credentials and detail-run pacing. Credentials are only checked
/// when a detail run starts.
#[derive(Debug, Clone)]
pub struct DirectorySettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub search_max: usize,
    pub match_threshold: f64,
    pub title_delay: Duration,
    pub miss_delay: Duration,
    pub rebuild_details: bool,
}

impl DirectorySettings {
    pub fn client_config(&self, user_agent: &str) -> Result<DirectoryConfig, ConfigError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("PODCASTINDEX_API_KEY"))?;
        let api_secret = self
            .api_secret
            .clone()
            .ok_or(ConfigError::Missing("PODCASTINDEX_API_SECRET"))?;
        Ok(DirectoryConfig {
            base_url: self.base_url.clone(),
            api_key,
            api_secret,
            user_agent: user_agent.to_string(),
            search_max: self.search_max,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SheetsSettings {
    pub spreadsheet_id: Option<String>,
    pub service_account_key: Option<PathBuf>,
    pub base_url: String,
    pub start_cell: String,
    pub targets_file: Option<PathBuf>,
}

impl SheetsSettings {
    pub async fn sheets_config(&self, timeout: Duration) -> Result<SheetsConfig> {
        let spreadsheet_id = self
            .spreadsheet_id
            .clone()
            .ok_or(ConfigError::Missing("GOOGLE_SHEET_ID"))?;
        let key = self
            .service_account_key
            .clone()
            .ok_or(ConfigError::Missing("GOOGLE_SERVICE_ACCOUNT_KEY"))?;
        let mut config = SheetsConfig::new(spreadsheet_id, key);
        config.base_url = self.base_url.clone();
        config.start_cell = self.start_cell.clone();
        config.timeout = timeout;
        if let Some(path) = &self.targets_file {
            config.targets = load_targets(path).await?;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub charts: ChartsConfig,
    pub directory: DirectorySettings,
    pub store: StoreConfig,
    pub sheets: SheetsSettings,
    pub user_agent: String,
    pub http_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; unset or empty values take defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse::<f64>().ok());
        let count = |key: &str, default: usize| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let millis = |key: &str, default: u64| {
            Duration::from_millis(
                var(key)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(default),
            )
        };

        Self {
            charts: ChartsConfig {
                region: var("PODCHARTS_REGION").unwrap_or_else(|| "us".to_string()),
                limit: count("PODCHARTS_CHART_LIMIT", 100),
                apple_url_template: var("PODCHARTS_APPLE_URL_TEMPLATE")
                    .unwrap_or_else(|| DEFAULT_APPLE_URL_TEMPLATE.to_string()),
                spotify_url: var("PODCHARTS_SPOTIFY_URL")
                    .unwrap_or_else(|| DEFAULT_SPOTIFY_URL.to_string()),
            },
            directory: DirectorySettings {
                base_url: var("PODCASTINDEX_BASE_URL")
                    .unwrap_or_else(|| podcharts_adapters::directory::DEFAULT_BASE_URL.to_string()),
                api_key: var("PODCASTINDEX_API_KEY"),
                api_secret: var("PODCASTINDEX_API_SECRET"),
                search_max: count("PODCHARTS_SEARCH_MAX", 10),
                match_threshold: parsed("PODCHARTS_MATCH_THRESHOLD")
                    .unwrap_or(DEFAULT_MATCH_THRESHOLD),
                title_delay: millis("PODCHARTS_TITLE_DELAY_MS", 1500),
                miss_delay: millis("PODCHARTS_MISS_DELAY_MS", 1000),
                rebuild_details: var("PODCHARTS_REBUILD_DETAILS")
                    .map(|v| {
                        !matches!(
                            v.trim().to_ascii_lowercase().as_str(),
                            "0" | "false" | "no" | "off"
                        )
                    })
                    .unwrap_or(true),
            },
            store: StoreConfig {
                db_path: var("PODCHARTS_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("data/podcasts.db")),
            },
            sheets: SheetsSettings {
                spreadsheet_id: var("GOOGLE_SHEET_ID"),
                service_account_key: var("GOOGLE_SERVICE_ACCOUNT_KEY").map(PathBuf::from),
                base_url: var("GOOGLE_SHEETS_BASE_URL")
                    .unwrap_or_else(|| podcharts_sheets::DEFAULT_BASE_URL.to_string()),
                start_cell: var("PODCHARTS_START_CELL")
                    .unwrap_or_else(|| podcharts_sheets::DEFAULT_START_CELL.to_string()),
                targets_file: var("PODCHARTS_PUBLISH_TARGETS").map(PathBuf::from),
            },
            user_agent: var("PODCHARTS_USER_AGENT")
                .unwrap_or_else(|| format!("podcharts/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout: Duration::from_secs(
                var("PODCHARTS_HTTP_TIMEOUT_SECS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(15),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformChartSummary {
    pub platform: Platform,
    pub fetched: usize,
    pub inserted: usize,
    pub ignored: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platforms: Vec<PlatformChartSummary>,
}

impl ChartRunSummary {
    pub fn fetched(&self) -> usize {
        self.platforms.iter().map(|p| p.fetched).sum()
    }

    pub fn inserted(&self) -> usize {
        self.platforms.iter().map(|p| p.inserted).sum()
    }

    pub fn ignored(&self) -> usize {
        self.platforms.iter().map(|p| p.ignored).sum()
    }

    pub fn failed(&self) -> usize {
        self.platforms.iter().map(|p| p.failed).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub titles: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub updated: usize,
    pub detail_failures: usize,
    pub update_errors: usize,
    pub category_link_errors: usize,
}

enum TitleOutcome {
    Unresolved,
    Processed,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: ChartStore,
    http: HttpFetcher,
}

impl Pipeline {
    /// Open the store and build the shared HTTP client. Failing to open the
    /// store is fatal.
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        let store = ChartStore::open(&config.store.db_path)
            .await
            .with_context(|| format!("opening store {}", config.store.db_path.display()))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            config,
            store,
            http,
        })
    }

    pub fn store(&self) -> &ChartStore {
        &self.store
    }

    /// Fetch each platform's chart and append it to `Top100Lists`.
    pub async fn run_charts(&self, platforms: &[Platform]) -> Result<ChartRunSummary> {
        let started_at = Utc::now();
        let ctx = AdapterContext::now();
        let request = ChartRequest {
            region: self.config.charts.region.clone(),
            limit: self.config.charts.limit,
        };

        let mut summaries = Vec::with_capacity(platforms.len());
        for platform in platforms {
            let adapter = adapter_for_platform(
                *platform,
                &self.config.charts.apple_url_template,
                &self.config.charts.spotify_url,
            );
            let entries = adapter.fetch_chart(&self.http, &ctx, &request).await;
            let written = self
                .store
                .write_chart_entries(&entries)
                .await
                .with_context(|| format!("writing {platform} chart"))?;
            summaries.push(PlatformChartSummary {
                platform: *platform,
                fetched: entries.len(),
                inserted: written.inserted,
                ignored: written.ignored,
                failed: written.failed,
            });
        }

        Ok(ChartRunSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            platforms: summaries,
        })
    }

    /// Resolve every charted title against the directory and store its details.
    pub async fn run_details(&self) -> Result<DetailRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let settings = &self.config.directory;
        let client_config = settings.client_config(&self.config.user_agent)?;
        let client = DirectoryClient::new(client_config, self.http.clone()).with_run_id(run_id);

        if settings.rebuild_details {
            self.store.rebuild_detail_tables().await?;
        }

        let titles = self.store.distinct_titles().await?;
        info!(%run_id, count = titles.len(), "resolving chart titles");

        let mut summary = DetailRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            titles: titles.len(),
            resolved: 0,
            unresolved: 0,
            updated: 0,
            detail_failures: 0,
            update_errors: 0,
            category_link_errors: 0,
        };

        for title in &titles {
            let span = info_span!("detail_title", %run_id, title = %title);
            let outcome = self
                .process_title(&client, title, &mut summary)
                .instrument(span)
                .await;
            let delay = match outcome {
                TitleOutcome::Unresolved => settings.miss_delay,
                TitleOutcome::Processed => settings.title_delay,
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            updated = summary.updated,
            update_errors = summary.update_errors,
            "detail run finished"
        );
        Ok(summary)
    }

    async fn process_title(
        &self,
        client: &DirectoryClient,
        title: &str,
        summary: &mut DetailRunSummary,
    ) -> TitleOutcome {
        let threshold = self.config.directory.match_threshold;
        let Some(found) = resolve_title(client, title, threshold).await else {
            warn!("no directory match");
            summary.unresolved += 1;
            return TitleOutcome::Unresolved;
        };
        summary.resolved += 1;

        let Some(podcast) = client.fetch_details(&found.candidate).await else {
            summary.detail_failures += 1;
            return TitleOutcome::Processed;
        };

        match self.store.upsert_podcast(&podcast).await {
            Ok(outcome) => {
                summary.updated += 1;
                summary.category_link_errors += outcome.skipped_categories;
            }
            Err(err) => {
                error!(podcast_id = podcast.podcast_id, error = %err, "podcast update failed");
                summary.update_errors += 1;
            }
        }
        TitleOutcome::Processed
    }

    /// Publish the reporting views. A credentials or token failure is logged
    /// and reported as a run with no updates.
    pub async fn run_publish(&self) -> Result<PublishSummary> {
        let sheets = self
            .config
            .sheets
            .sheets_config(self.config.http_timeout)
            .await?;
        let client = match GoogleSheetsClient::connect(&sheets).await {
            Ok(client) => client,
            Err(err) => {
                error!(error = %err, "spreadsheet setup failed");
                return Ok(PublishSummary::default());
            }
        };
        Ok(publish_views(&self.store, &client, &sheets.targets, &sheets.start_cell).await)
    }
}

pub async fn run_charts_once_from_env(platforms: &[Platform]) -> Result<ChartRunSummary> {
    let pipeline = Pipeline::open(PipelineConfig::from_env()).await?;
    pipeline.run_charts(platforms).await
}

pub async fn run_details_once_from_env() -> Result<DetailRunSummary> {
    let pipeline = Pipeline::open(PipelineConfig::from_env()).await?;
    pipeline.run_details().await
}

pub async fn run_publish_once_from_env() -> Result<PublishSummary> {
    let pipeline = Pipeline::open(PipelineConfig::from_env()).await?;
    pipeline.run_publish().await
}
