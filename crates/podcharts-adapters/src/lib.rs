//! Chart adapter contracts, the podcast directory client and title resolution.

pub mod directory;
pub mod resolver;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use podcharts_core::{ChartEntry, Platform};
use podcharts_storage::{FetchError, GetRequest, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use directory::{DirectoryClient, DirectoryConfig, DirectoryError, DirectoryFeed};
pub use resolver::{SearchStrategy, TitleMatch};

pub const CRATE_NAME: &str = "podcharts-adapters";

pub const DEFAULT_APPLE_URL_TEMPLATE: &str =
    "https://rss.marketingtools.apple.com/api/v2/{region}/podcasts/top/{limit}/podcasts.json";
pub const DEFAULT_SPOTIFY_URL: &str = "https://podcastcharts.byspotify.com/api/charts/top";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub chart_date: NaiveDate,
}

impl AdapterContext {
    /// Context for a run happening now; the chart date is the local calendar day.
    pub fn now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
            chart_date: Local::now().date_naive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRequest {
    pub region: String,
    pub limit: usize,
}

impl Default for ChartRequest {
    fn default() -> Self {
        Self {
            region: "us".to_string(),
            limit: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed JSON response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

#[async_trait]
pub trait ChartAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn chart_url(&self, request: &ChartRequest) -> String;

    fn chart_query(&self, _request: &ChartRequest) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Turn a decoded response body into ranked entries. Ranks follow response order.
    fn parse_chart(
        &self,
        body: &JsonValue,
        request: &ChartRequest,
        chart_date: NaiveDate,
    ) -> Result<Vec<ChartEntry>, AdapterError>;

    async fn try_fetch_chart(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        request: &ChartRequest,
    ) -> Result<Vec<ChartEntry>, AdapterError> {
        let url = self.chart_url(request);
        info!(platform = %self.platform(), %url, "requesting chart data");
        let mut get = GetRequest::new(&url);
        for (key, value) in self.chart_query(request) {
            get = get.query(key, value);
        }
        let response = http.get(ctx.run_id, self.platform().as_str(), get).await?;
        debug!(snippet = %response.snippet(200), "chart response");
        let body: JsonValue = response.json()?;
        self.parse_chart(&body, request, ctx.chart_date)
    }

    /// Fetch and parse the chart. Any failure is logged and yields no entries.
    async fn fetch_chart(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        request: &ChartRequest,
    ) -> Vec<ChartEntry> {
        match self.try_fetch_chart(http, ctx, request).await {
            Ok(entries) => {
                info!(platform = %self.platform(), count = entries.len(), "parsed chart entries");
                entries
            }
            Err(err) => {
                error!(platform = %self.platform(), error = %err, "chart fetch failed");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppleChartAdapter {
    url_template: String,
}

impl AppleChartAdapter {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }
}

impl Default for AppleChartAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_APPLE_URL_TEMPLATE)
    }
}

#[async_trait]
impl ChartAdapter for AppleChartAdapter {
    fn platform(&self) -> Platform {
        Platform::Apple
    }

    fn chart_url(&self, request: &ChartRequest) -> String {
        self.url_template
            .replace("{region}", &request.region)
            .replace("{limit}", &request.limit.to_string())
    }

    fn parse_chart(
        &self,
        body: &JsonValue,
        request: &ChartRequest,
        chart_date: NaiveDate,
    ) -> Result<Vec<ChartEntry>, AdapterError> {
        let feed = body
            .get("feed")
            .filter(|v| v.is_object())
            .ok_or_else(|| AdapterError::Shape("missing `feed` object".into()))?;
        let results = feed
            .get("results")
            .and_then(JsonValue::as_array)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| AdapterError::Shape("missing `feed.results` list".into()))?;

        Ok(rank_items(results, request.limit, |item, rank| ChartEntry {
            platform: Platform::Apple,
            rank,
            title: json_text(item.get("name")),
            platform_podcast_id: json_text(item.get("id")),
            date: chart_date,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct SpotifyChartAdapter {
    base_url: String,
}

impl SpotifyChartAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for SpotifyChartAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_SPOTIFY_URL)
    }
}

#[async_trait]
impl ChartAdapter for SpotifyChartAdapter {
    fn platform(&self) -> Platform {
        Platform::Spotify
    }

    fn chart_url(&self, _request: &ChartRequest) -> String {
        self.base_url.clone()
    }

    fn chart_query(&self, request: &ChartRequest) -> Vec<(&'static str, String)> {
        vec![("region", request.region.clone())]
    }

    fn parse_chart(
        &self,
        body: &JsonValue,
        request: &ChartRequest,
        chart_date: NaiveDate,
    ) -> Result<Vec<ChartEntry>, AdapterError> {
        let items = body
            .as_array()
            .filter(|items| !items.is_empty())
            .ok_or_else(|| AdapterError::Shape("expected a top-level list of shows".into()))?;

        Ok(rank_items(items, request.limit, |item, rank| ChartEntry {
            platform: Platform::Spotify,
            rank,
            title: json_text(item.get("showName")),
            platform_podcast_id: item
                .get("showUri")
                .and_then(JsonValue::as_str)
                .and_then(spotify_show_id),
            date: chart_date,
        }))
    }
}

/// `spotify:show:abc123` -> `abc123`.
pub fn spotify_show_id(uri: &str) -> Option<String> {
    if !uri.contains(':') {
        return None;
    }
    uri.rsplit(':')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

pub fn adapter_for_platform(
    platform: Platform,
    apple_url_template: &str,
    spotify_url: &str,
) -> Box<dyn ChartAdapter> {
    match platform {
        Platform::Apple => Box::new(AppleChartAdapter::new(apple_url_template)),
        Platform::Spotify => Box::new(SpotifyChartAdapter::new(spotify_url)),
    }
}

// Non-object items still occupy their rank slot.
fn rank_items<F>(items: &[JsonValue], limit: usize, mut build: F) -> Vec<ChartEntry>
where
    F: FnMut(&JsonValue, u32) -> ChartEntry,
{
    items
        .iter()
        .take(limit)
        .enumerate()
        .filter_map(|(index, item)| {
            if !item.is_object() {
                warn!(index, "skipping chart item that is not an object");
                return None;
            }
            let rank = u32::try_from(index + 1).ok()?;
            Some(build(item, rank))
        })
        .collect()
}

fn json_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use podcharts_storage::HttpClientConfig;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    fn request(limit: usize) -> ChartRequest {
        ChartRequest {
            region: "us".into(),
            limit,
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
            chart_date: date(),
        }
    }

    fn apple_body(count: usize) -> JsonValue {
        let results: Vec<JsonValue> = (0..count)
            .map(|i| json!({"name": format!("Show {i}"), "id": format!("{}", 1000 + i)}))
            .collect();
        json!({"feed": {"title": "Top Shows", "results": results}})
    }

    #[test]
    fn apple_ranks_follow_response_order_and_limit() {
        let entries = AppleChartAdapter::default()
            .parse_chart(&apple_body(5), &request(3), date())
            .unwrap();
        let ranks: Vec<u32> = entries.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(entries[0].title.as_deref(), Some("Show 0"));
        assert_eq!(entries[2].platform_podcast_id.as_deref(), Some("1002"));
        assert!(entries.iter().all(|e| e.platform == Platform::Apple && e.date == date()));
    }

    #[test]
    fn apple_short_response_yields_all_items() {
        let entries = AppleChartAdapter::default()
            .parse_chart(&apple_body(2), &request(100), date())
            .unwrap();
        assert_eq!(entries.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn apple_missing_structure_is_an_error() {
        let adapter = AppleChartAdapter::default();
        for body in [
            json!({}),
            json!({"feed": []}),
            json!({"feed": {"results": {}}}),
            json!({"feed": {"results": []}}),
            json!([1, 2, 3]),
        ] {
            assert!(adapter.parse_chart(&body, &request(10), date()).is_err());
        }
    }

    #[test]
    fn apple_url_template_is_filled() {
        let adapter = AppleChartAdapter::default();
        assert_eq!(
            adapter.chart_url(&ChartRequest {
                region: "gb".into(),
                limit: 50
            }),
            "https://rss.marketingtools.apple.com/api/v2/gb/podcasts/top/50/podcasts.json"
        );
    }

    #[test]
    fn spotify_extracts_show_id_from_uri() {
        let body = json!([
            {"showName": "First", "showUri": "spotify:show:abc"},
            {"showName": "Second", "showUri": "no-colon"},
            {"showName": "Third"}
        ]);
        let entries = SpotifyChartAdapter::default()
            .parse_chart(&body, &request(100), date())
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].platform_podcast_id.as_deref(), Some("abc"));
        assert_eq!(entries[1].platform_podcast_id, None);
        assert_eq!(entries[2].platform_podcast_id, None);
        assert_eq!(entries[2].rank, 3);
    }

    #[test]
    fn spotify_non_object_items_keep_rank_positions() {
        let body = json!([{"showName": "A"}, "garbage", {"showName": "C"}]);
        let entries = SpotifyChartAdapter::default()
            .parse_chart(&body, &request(100), date())
            .unwrap();
        assert_eq!(
            entries.iter().map(|e| e.rank).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn spotify_requires_top_level_list() {
        let adapter = SpotifyChartAdapter::default();
        assert!(adapter
            .parse_chart(&json!({"shows": []}), &request(10), date())
            .is_err());
        assert!(adapter.parse_chart(&json!([]), &request(10), date()).is_err());
    }

    #[tokio::test]
    async fn fetch_chart_returns_empty_on_http_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/charts");
                then.status(500);
            })
            .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = SpotifyChartAdapter::new(server.url("/charts"));
        assert!(adapter.fetch_chart(&http, &ctx(), &request(10)).await.is_empty());
    }

    #[tokio::test]
    async fn fetch_chart_returns_empty_on_malformed_json() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/us/podcasts/top/10/podcasts.json");
                then.status(200).body("<html>not json</html>");
            })
            .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = AppleChartAdapter::new(
            server.url("/{region}/podcasts/top/{limit}/podcasts.json"),
        );
        assert!(adapter.fetch_chart(&http, &ctx(), &request(10)).await.is_empty());
    }

    #[tokio::test]
    async fn fetch_chart_sends_region_to_spotify() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/charts").query_param("region", "us");
                then.status(200)
                    .json_body(json!([{"showName": "Only", "showUri": "spotify:show:1"}]));
            })
            .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = SpotifyChartAdapter::new(server.url("/charts"));
        let entries = adapter.fetch_chart(&http, &ctx(), &request(10)).await;
        mock.assert_async().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title.as_deref(), Some("Only"));
    }
}
