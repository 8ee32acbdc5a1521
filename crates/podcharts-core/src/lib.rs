//! Core domain model for the podcast chart pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "podcharts-core";

/// Chart platform a ranking snapshot was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Apple,
    Spotify,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Apple, Platform::Spotify];

    /// Value stored in the `platform` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Apple => "Apple",
            Platform::Spotify => "Spotify",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apple" => Ok(Platform::Apple),
            "spotify" => Ok(Platform::Spotify),
            other => Err(format!("unknown platform `{other}`")),
        }
    }
}

/// One ranked position on a platform's daily chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartEntry {
    pub platform: Platform,
    pub rank: u32,
    pub title: Option<String>,
    pub platform_podcast_id: Option<String>,
    pub date: NaiveDate,
}

impl ChartEntry {
    /// Checks the fields the ranking table requires. Title and platform id are optional.
    pub fn validate(&self) -> Result<(), String> {
        if self.rank == 0 {
            return Err(format!(
                "{} entry dated {} has no rank",
                self.platform, self.date
            ));
        }
        Ok(())
    }

    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

/// Directory category map as returned by the API: `{"55": "News", ...}`.
pub type CategoryMap = BTreeMap<String, String>;

/// Search hit from the podcast directory.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectoryCandidate {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub title_original: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "originalUrl")]
    pub original_url: Option<String>,
}

impl DirectoryCandidate {
    /// Title used for matching: `title_original` when present, else `title`.
    pub fn match_title(&self) -> Option<&str> {
        self.title_original
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.title.as_deref().filter(|t| !t.is_empty()))
    }

    /// Feed URL usable for the by-url detail fallback.
    pub fn feed_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| self.original_url.as_deref().filter(|u| !u.is_empty()))
    }
}

/// Derived statistics over the most recent episodes of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EpisodeStats {
    pub avg_duration_last_10: Option<i64>,
    pub latest_episode_title: Option<String>,
}

/// Resolved podcast metadata, one row of `Podcasts` plus its category links.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Podcast {
    pub podcast_id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub feed_url: Option<String>,
    pub image_url: Option<String>,
    pub episode_count: Option<i64>,
    pub avg_duration_last_10: Option<i64>,
    pub latest_episode_title: Option<String>,
    pub last_update_time: Option<i64>,
    pub podcast_guid: Option<String>,
    pub original_url: Option<String>,
    pub categories: CategoryMap,
}

/// A single spreadsheet cell read back from a store view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Empty,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// NaN and infinities cannot be serialized to JSON; they publish as blanks.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() {
            Cell::Float(value)
        } else {
            Cell::Empty
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Cell::Empty => JsonValue::String(String::new()),
            Cell::Int(v) => JsonValue::from(*v),
            Cell::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(String::new())),
            Cell::Text(v) => JsonValue::String(v.clone()),
        }
    }
}

/// Tabular result of a store query: header row plus data rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    /// Header followed by the data rows, as JSON values ready for a sheet update.
    pub fn to_values(&self) -> Vec<Vec<JsonValue>> {
        let mut out = Vec::with_capacity(self.rows.len() + 1);
        out.push(
            self.columns
                .iter()
                .map(|c| JsonValue::String(c.clone()))
                .collect(),
        );
        for row in &self.rows {
            out.push(row.iter().map(Cell::to_json).collect());
        }
        out
    }
}

/// Directory ids arrive as numbers, but some endpoints hand them back as strings.
pub fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_i64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
