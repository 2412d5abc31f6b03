//! Remote spreadsheet backend.

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::{debug, info};

use crate::config::SheetTarget;
use crate::error::AppendError;

/// Environment variable that overrides the credential file.
pub const TOKEN_ENV: &str = "SHEETS_ACCESS_TOKEN";

/// Append-only view of the spreadsheet store.
#[async_trait]
pub trait SheetsClient: Send + Sync {
    /// Whether the worksheet has no rows yet (so it needs a header). A
    /// worksheet that does not exist is created and reported empty.
    async fn is_empty(&self, target: &SheetTarget) -> Result<bool, AppendError>;

    async fn append_rows(&self, target: &SheetTarget, rows: &[Vec<String>]) -> Result<(), AppendError>;
}

/// Google Sheets v4 REST client authenticated with a bearer token.
pub struct GoogleSheetsClient {
    client: Client,
    token: String,
    base_url: Url,
}

#[derive(Deserialize)]
struct TokenPayload {
    access_token: String,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl GoogleSheetsClient {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("oareport-scraper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            token: token.into(),
            base_url: Url::parse("https://sheets.googleapis.com/")?,
        })
    }

    /// Reads the access token from `SHEETS_ACCESS_TOKEN` or the credential payload.
    pub fn from_credentials(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                return Self::new(token.trim());
            }
        }
        let Some(path) = path else {
            bail!("no spreadsheet credentials: set {} or export.credentials", TOKEN_ENV);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let payload: TokenPayload = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Self::new(payload.access_token)
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url, AppendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppendError::MalformedPayload("invalid base URL".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, target: &SheetTarget, range: &str) -> Result<Url, AppendError> {
        self.api_url(&["v4", "spreadsheets", target.spreadsheet_id.as_str(), "values", range])
    }

    fn batch_update_url(&self, target: &SheetTarget) -> Result<Url, AppendError> {
        let segment = format!("{}:batchUpdate", target.spreadsheet_id);
        self.api_url(&["v4", "spreadsheets", segment.as_str()])
    }

    async fn add_worksheet(&self, target: &SheetTarget) -> Result<(), AppendError> {
        info!("Creating worksheet '{}' in {}", target.worksheet, target.spreadsheet_id);
        let response = self
            .client
            .post(self.batch_update_url(target)?)
            .bearer_auth(&self.token)
            .json(&add_sheet_request(&target.worksheet))
            .send()
            .await
            .map_err(network)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AppendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

fn add_sheet_request(title: &str) -> serde_json::Value {
    json!({ "requests": [{ "addSheet": { "properties": { "title": title } } }] })
}

/// A range naming a worksheet that does not exist is rejected as unparsable.
pub fn is_missing_worksheet(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST && body.contains("Unable to parse range")
}

fn sheet_range(worksheet: &str, cells: &str) -> String {
    format!("'{}'!{}", worksheet.replace('\'', "''"), cells)
}

/// Maps an unsuccessful response onto the retry taxonomy.
pub fn classify_failure(status: StatusCode, body: &str) -> AppendError {
    let detail = format!("{}: {}", status, body.chars().take(300).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS
        || body.contains("Quota exceeded")
        || body.contains("RATE_LIMIT_EXCEEDED")
    {
        AppendError::RateLimited(detail)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AppendError::Auth(detail)
    } else if status.is_client_error() {
        AppendError::MalformedPayload(detail)
    } else {
        AppendError::Network(detail)
    }
}

fn network(e: reqwest::Error) -> AppendError {
    AppendError::Network(e.to_string())
}

#[async_trait]
impl SheetsClient for GoogleSheetsClient {
    async fn is_empty(&self, target: &SheetTarget) -> Result<bool, AppendError> {
        let url = self.values_url(target, &sheet_range(&target.worksheet, "A1:A1"))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_missing_worksheet(status, &body) {
                self.add_worksheet(target).await?;
                return Ok(true);
            }
            return Err(classify_failure(status, &body));
        }
        let range: ValueRange = response.json().await.map_err(network)?;
        Ok(range.values.is_empty())
    }

    async fn append_rows(&self, target: &SheetTarget, rows: &[Vec<String>]) -> Result<(), AppendError> {
        let range = format!("{}:append", sheet_range(&target.worksheet, "A1"));
        let mut url = self.values_url(target, &range)?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        debug!("Appending {} rows to {}/{}", rows.len(), target.spreadsheet_id, target.worksheet);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({ "values": rows }))
            .send()
            .await
            .map_err(network)?;
        Self::check(response).await?;
        Ok(())
    }
}
