//! Podcast Index client: signed requests, search, feed details and episode stats.

use chrono::Utc;
use podcharts_core::{lenient_i64, CategoryMap, DirectoryCandidate, EpisodeStats, Podcast};
use podcharts_storage::{FetchError, GetRequest, HttpFetcher};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "https://api.podcastindex.org/api/1.0/";
pub const EPISODE_WINDOW: usize = 10;

const SOURCE_ID: &str = "podcastindex";

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub user_agent: String,
    pub search_max: usize,
}

impl DirectoryConfig {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            user_agent: format!("podcharts/{}", env!("CARGO_PKG_VERSION")),
            search_max: 10,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed directory response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("directory response has no `feed` payload")]
    MissingFeed,
}

/// `Authorization` header value: lowercase hex SHA-1 of key, secret and timestamp.
pub fn sign(api_key: &str, api_secret: &str, timestamp: i64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(api_key.as_bytes());
    hasher.update(api_secret.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn auth_headers(config: &DirectoryConfig, timestamp: i64) -> Vec<(&'static str, String)> {
    vec![
        ("User-Agent", config.user_agent.clone()),
        ("X-Auth-Key", config.api_key.clone()),
        ("X-Auth-Date", timestamp.to_string()),
        (
            "Authorization",
            sign(&config.api_key, &config.api_secret, timestamp),
        ),
    ]
}

/// Feed payload of `podcasts/byfeedid` and `podcasts/byfeedurl`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryFeed {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub original_url: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub artwork: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub episode_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub last_update_time: Option<i64>,
    #[serde(default)]
    pub podcast_guid: Option<String>,
    #[serde(default, deserialize_with = "lenient_categories")]
    pub categories: CategoryMap,
}

impl DirectoryFeed {
    /// Fill missing feed URLs from the search hit that led here.
    pub fn fill_from_candidate(&mut self, candidate: &DirectoryCandidate) {
        if is_blank(&self.url) {
            self.url = candidate.url.clone();
        }
        if is_blank(&self.original_url) {
            self.original_url = candidate.original_url.clone();
        }
    }

    /// `None` when the payload carries no feed id.
    pub fn into_podcast(self, stats: EpisodeStats) -> Option<Podcast> {
        let podcast_id = self.id?;
        let image_url = if is_blank(&self.image) {
            self.artwork
        } else {
            self.image
        };
        Some(Podcast {
            podcast_id,
            title: self.title,
            description: self.description,
            feed_url: self.url,
            image_url,
            episode_count: self.episode_count,
            avg_duration_last_10: stats.avg_duration_last_10,
            latest_episode_title: stats.latest_episode_title,
            last_update_time: self.last_update_time,
            podcast_guid: self.podcast_guid,
            original_url: self.original_url,
            categories: self.categories,
        })
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

// The API sends `{"55": "News"}`, `null`, or occasionally an empty list.
fn lenient_categories<'de, D>(deserializer: D) -> Result<CategoryMap, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    let mut out = CategoryMap::new();
    if let Some(JsonValue::Object(map)) = value {
        for (id, name) in map {
            let name = match name {
                JsonValue::String(s) => s,
                JsonValue::Null => String::new(),
                other => other.to_string(),
            };
            out.insert(id, name);
        }
    }
    Ok(out)
}

/// Latest title and mean positive duration over a newest-first episode list.
pub fn episode_stats(items: &[JsonValue]) -> EpisodeStats {
    let latest_episode_title = items
        .first()
        .and_then(|item| item.get("title"))
        .and_then(JsonValue::as_str)
        .map(str::to_string);

    let durations: Vec<i64> = items
        .iter()
        .filter_map(|item| item.get("duration").and_then(JsonValue::as_i64))
        .filter(|d| *d > 0)
        .collect();
    let avg_duration_last_10 = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<i64>() / durations.len() as i64)
    };

    EpisodeStats {
        avg_duration_last_10,
        latest_episode_title,
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryClient {
    config: DirectoryConfig,
    http: HttpFetcher,
    run_id: Uuid,
}

impl DirectoryClient {
    pub fn new(config: DirectoryConfig, http: HttpFetcher) -> Self {
        Self {
            config,
            http,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    async fn get_json(
        &self,
        path: &str,
        query: Vec<(&'static str, String)>,
    ) -> Result<JsonValue, DirectoryError> {
        let url = self.config.endpoint(path);
        let mut request = GetRequest::new(&url);
        for (key, value) in query {
            request = request.query(key, value);
        }
        for (key, value) in auth_headers(&self.config, Utc::now().timestamp()) {
            request = request.header(key, value);
        }
        let response = self.http.get(self.run_id, SOURCE_ID, request).await?;
        Ok(response.json()?)
    }

    /// `search/byterm`; hits live under `feeds`, older responses use `results`.
    pub async fn search_by_term(
        &self,
        query: &str,
    ) -> Result<Vec<DirectoryCandidate>, DirectoryError> {
        let body = self
            .get_json(
                "search/byterm",
                vec![("q", query.to_string()), ("max", self.config.search_max.to_string())],
            )
            .await?;
        let hits = body
            .get("feeds")
            .filter(|v| v.is_array())
            .or_else(|| body.get("results"))
            .cloned()
            .unwrap_or(JsonValue::Array(Vec::new()));
        decode_candidates(hits)
    }

    pub async fn search_by_title(
        &self,
        query: &str,
    ) -> Result<Vec<DirectoryCandidate>, DirectoryError> {
        let body = self
            .get_json(
                "search/bytitle",
                vec![("q", query.to_string()), ("max", self.config.search_max.to_string())],
            )
            .await?;
        let hits = body
            .get("feeds")
            .cloned()
            .unwrap_or(JsonValue::Array(Vec::new()));
        decode_candidates(hits)
    }

    pub async fn podcast_by_feed_id(&self, id: i64) -> Result<DirectoryFeed, DirectoryError> {
        let body = self
            .get_json("podcasts/byfeedid", vec![("id", id.to_string())])
            .await?;
        decode_feed(body)
    }

    pub async fn podcast_by_feed_url(&self, url: &str) -> Result<DirectoryFeed, DirectoryError> {
        let body = self
            .get_json("podcasts/byfeedurl", vec![("url", url.to_string())])
            .await?;
        decode_feed(body)
    }

    pub async fn recent_episodes(&self, feed_id: i64) -> Result<Vec<JsonValue>, DirectoryError> {
        let body = self
            .get_json(
                "episodes/byfeedid",
                vec![("id", feed_id.to_string()), ("max", EPISODE_WINDOW.to_string())],
            )
            .await?;
        Ok(match body.get("items") {
            Some(JsonValue::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    /// Episode statistics for a feed. Failures produce empty stats.
    pub async fn episode_stats(&self, feed_id: i64) -> EpisodeStats {
        match self.recent_episodes(feed_id).await {
            Ok(items) => episode_stats(&items),
            Err(err) => {
                warn!(feed_id, error = %err, "episode lookup failed");
                EpisodeStats::default()
            }
        }
    }

    /// Feed details for a resolved candidate: by id first, then by feed URL.
    pub async fn fetch_feed(
        &self,
        candidate: &DirectoryCandidate,
    ) -> Result<DirectoryFeed, DirectoryError> {
        let by_id = match candidate.id {
            Some(id) => match self.podcast_by_feed_id(id).await {
                Ok(feed) => Some(feed),
                Err(err) => {
                    warn!(feed_id = id, error = %err, "lookup by feed id failed");
                    None
                }
            },
            None => None,
        };

        let mut feed = match (by_id, candidate.feed_url()) {
            (Some(feed), _) => feed,
            (None, Some(url)) => {
                debug!(%url, "falling back to lookup by feed url");
                self.podcast_by_feed_url(url).await?
            }
            (None, None) => return Err(DirectoryError::MissingFeed),
        };
        feed.fill_from_candidate(candidate);
        Ok(feed)
    }

    /// Full podcast record for a candidate, or `None` when the lookup fails or
    /// the returned payload has no id of its own.
    pub async fn fetch_details(&self, candidate: &DirectoryCandidate) -> Option<Podcast> {
        let feed = match self.fetch_feed(candidate).await {
            Ok(feed) => feed,
            Err(err) => {
                warn!(candidate_id = ?candidate.id, error = %err, "detail fetch failed");
                return None;
            }
        };
        let Some(feed_id) = feed.id else {
            warn!(
                candidate_id = ?candidate.id,
                title = ?feed.title,
                "detail payload has no feed id; skipping"
            );
            return None;
        };
        let stats = self.episode_stats(feed_id).await;
        info!(feed_id, "fetched podcast details");
        feed.into_podcast(stats)
    }
}

fn decode_candidates(hits: JsonValue) -> Result<Vec<DirectoryCandidate>, DirectoryError> {
    let JsonValue::Array(items) = hits else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter(JsonValue::is_object)
        .map(serde_json::from_value)
        .collect::<Result<Vec<DirectoryCandidate>, _>>()?)
}

fn decode_feed(mut body: JsonValue) -> Result<DirectoryFeed, DirectoryError> {
    match body.get_mut("feed").map(JsonValue::take) {
        Some(feed @ JsonValue::Object(_)) => Ok(serde_json::from_value(feed)?),
        _ => Err(DirectoryError::MissingFeed),
    }
}
