//! Google Sheets publishing of the store's reporting views.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use podcharts_storage::ChartStore;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "podcharts-sheets";

pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_START_CELL: &str = "A1";

const SCOPES: &str =
    "https://www.googleapis.com/auth/spreadsheets https://www.googleapis.com/auth/drive.file";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// One view published to one worksheet tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    pub query: String,
    pub worksheet: String,
}

impl PublishTarget {
    pub fn new(query: impl Into<String>, worksheet: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            worksheet: worksheet.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublishTargetsFile {
    targets: Vec<PublishTarget>,
}

pub fn default_targets() -> Vec<PublishTarget> {
    vec![
        PublishTarget::new(
            "SELECT * FROM vw_CurrentPodcastDetailsWithCategories",
            "Top100List",
        ),
        PublishTarget::new("SELECT * FROM vw_NewEntries", "NewEntries"),
        PublishTarget::new("SELECT * FROM vw_PlatformOverlap", "PlatformOverlap"),
        PublishTarget::new("SELECT * FROM vw_RankChanges", "RankChanges"),
        PublishTarget::new("SELECT * FROM vw_TimeOnList", "TimeOnList"),
    ]
}

/// Read a `targets:` list from YAML.
pub async fn load_targets(path: impl AsRef<Path>) -> anyhow::Result<Vec<PublishTarget>> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading publish targets {}", path.display()))?;
    let file: PublishTargetsFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing publish targets {}", path.display()))?;
    Ok(file.targets)
}

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    pub service_account_key: PathBuf,
    pub base_url: String,
    pub start_cell: String,
    pub timeout: Duration,
    pub targets: Vec<PublishTarget>,
}

impl SheetsConfig {
    pub fn new(spreadsheet_id: impl Into<String>, service_account_key: impl Into<PathBuf>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            service_account_key: service_account_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            start_cell: DEFAULT_START_CELL.to_string(),
            timeout: Duration::from_secs(15),
            targets: default_targets(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("service account credentials: {0}")]
    Credentials(String),
    #[error("token exchange failed: {0}")]
    Auth(String),
    #[error("sheets request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sheets returned http {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed sheets response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Fields of a Google service-account JSON key that the token exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl ServiceAccountKey {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SheetsError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            SheetsError::Credentials(format!("reading {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|err| SheetsError::Credentials(format!("parsing {}: {err}", path.display())))
    }

    /// Signed RS256 assertion valid for one hour from `now`.
    pub fn assertion(&self, now: DateTime<Utc>) -> Result<String, SheetsError> {
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: SCOPES,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|err| SheetsError::Credentials(format!("private key: {err}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| SheetsError::Credentials(format!("signing assertion: {err}")))
    }

    /// Trade a fresh assertion for a bearer token at `token_uri`.
    pub async fn access_token(&self, http: &reqwest::Client) -> Result<String, SheetsError> {
        let assertion = self.assertion(Utc::now())?;
        let resp = http
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| SheetsError::Auth(err.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|err| SheetsError::Auth(err.to_string()))?;
        if !status.is_success() {
            return Err(SheetsError::Auth(format!(
                "http {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| SheetsError::Auth(format!("token response: {err}")))?;
        Ok(token.access_token)
    }
}

/// The three spreadsheet operations the publisher performs.
#[async_trait]
pub trait SpreadsheetClient: Send + Sync {
    async fn worksheet_titles(&self) -> Result<Vec<String>, SheetsError>;

    async fn clear(&self, worksheet: &str) -> Result<(), SheetsError>;

    async fn update(
        &self,
        worksheet: &str,
        start_cell: &str,
        values: Vec<Vec<JsonValue>>,
    ) -> Result<(), SheetsError>;
}

/// A1 reference to a worksheet, quoting names that need it.
pub fn sheet_range(worksheet: &str, cell: Option<&str>) -> String {
    let plain = !worksheet.is_empty()
        && worksheet
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    let sheet = if plain {
        worksheet.to_string()
    } else {
        format!("'{}'", worksheet.replace('\'', "''"))
    };
    match cell {
        Some(cell) => format!("{sheet}!{cell}"),
        None => sheet,
    }
}

#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    token: String,
}

impl GoogleSheetsClient {
    /// Read the service-account key and obtain a bearer token.
    pub async fn connect(config: &SheetsConfig) -> Result<Self, SheetsError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let key = ServiceAccountKey::from_file(&config.service_account_key).await?;
        let token = key.access_token(&http).await?;
        info!(client_email = %key.client_email, "obtained sheets access token");
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            token,
        })
    }

    fn url(&self, tail: &[&str]) -> Result<Url, SheetsError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| SheetsError::Credentials(format!("base url {}: {err}", self.base_url)))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                SheetsError::Credentials(format!("base url {} cannot take a path", self.base_url))
            })?;
            segments.pop_if_empty();
            segments.push("spreadsheets");
            segments.push(&self.spreadsheet_id);
            for part in tail {
                segments.push(part);
            }
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<JsonValue, SheetsError> {
        let resp = request.bearer_auth(&self.token).send().await?;
        let status = resp.status();
        let url = resp.url().to_string();
        if !status.is_success() {
            return Err(SheetsError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body = resp.bytes().await?;
        if body.is_empty() {
            return Ok(JsonValue::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl SpreadsheetClient for GoogleSheetsClient {
    async fn worksheet_titles(&self) -> Result<Vec<String>, SheetsError> {
        let url = self.url(&[])?;
        let body = self
            .send(
                self.http
                    .get(url)
                    .query(&[("fields", "sheets.properties.title")]),
            )
            .await?;
        let titles = body
            .get("sheets")
            .and_then(JsonValue::as_array)
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| s.pointer("/properties/title"))
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(titles)
    }

    async fn clear(&self, worksheet: &str) -> Result<(), SheetsError> {
        let range = sheet_range(worksheet, None);
        let url = self.url(&["values", &format!("{range}:clear")])?;
        self.send(self.http.post(url).json(&json!({}))).await?;
        Ok(())
    }

    async fn update(
        &self,
        worksheet: &str,
        start_cell: &str,
        values: Vec<Vec<JsonValue>>,
    ) -> Result<(), SheetsError> {
        let range = sheet_range(worksheet, Some(start_cell));
        let url = self.url(&["values", &range])?;
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": values,
        });
        self.send(
            self.http
                .put(url)
                .query(&[("valueInputOption", "USER_ENTERED")])
                .json(&body),
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Refresh each target tab from its query. A failing tab is logged and counted
/// and the remaining tabs are still published.
pub async fn publish_views<C>(
    store: &ChartStore,
    client: &C,
    targets: &[PublishTarget],
    start_cell: &str,
) -> PublishSummary
where
    C: SpreadsheetClient + ?Sized,
{
    let mut summary = PublishSummary::default();

    let existing = match client.worksheet_titles().await {
        Ok(titles) => titles,
        Err(err) => {
            error!(error = %err, "could not list worksheets");
            summary.failed = targets.len();
            return summary;
        }
    };

    for target in targets {
        let span = info_span!("publish_tab", worksheet = %target.worksheet);
        let outcome = publish_one(store, client, target, start_cell, &existing)
            .instrument(span)
            .await;
        match outcome {
            Ok(true) => summary.updated += 1,
            Ok(false) => summary.skipped += 1,
            Err(err) => {
                error!(worksheet = %target.worksheet, error = %err, "publish failed");
                summary.failed += 1;
            }
        }
    }

    info!(
        updated = summary.updated,
        skipped = summary.skipped,
        failed = summary.failed,
        "publish finished"
    );
    summary
}

async fn publish_one<C>(
    store: &ChartStore,
    client: &C,
    target: &PublishTarget,
    start_cell: &str,
    existing: &[String],
) -> anyhow::Result<bool>
where
    C: SpreadsheetClient + ?Sized,
{
    let table = store
        .query_table(&target.query)
        .await
        .with_context(|| format!("running `{}`", target.query))?;

    if !existing.iter().any(|t| t == &target.worksheet) {
        warn!(worksheet = %target.worksheet, "worksheet not found; skipping");
        return Ok(false);
    }

    client
        .clear(&target.worksheet)
        .await
        .with_context(|| format!("clearing {}", target.worksheet))?;
    client
        .update(&target.worksheet, start_cell, table.to_values())
        .await
        .with_context(|| format!("writing {}", target.worksheet))?;
    info!(rows = table.rows.len(), "worksheet updated");
    Ok(true)
}
