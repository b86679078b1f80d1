//! GH Archive hourly event dumps.

use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use flate2::read::GzDecoder;
use reqwest::Client;
use serde_json::Value;

use super::USER_AGENT;
use crate::error::FetchError;
use crate::queue::Candidate;

const GH_ARCHIVE_BASE_URL: &str = "https://data.gharchive.org";

/// Result of fetching one hourly dump.
#[derive(Debug)]
pub enum HourFetch {
    /// The hour has not been published yet.
    NotPublished,
    /// Repositories seen in the hour, one candidate per repository id.
    Candidates(Vec<Candidate>),
}

#[derive(Debug, Clone)]
pub struct ArchiveClient {
    client: Client,
    base_url: String,
}

impl ArchiveClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: GH_ARCHIVE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Locator for the dump covering `hour`. Hours are not zero padded.
    pub fn hour_url(&self, hour: DateTime<Utc>) -> String {
        format!(
            "{}/{}-{}.json.gz",
            self.base_url,
            hour.format("%Y-%m-%d"),
            hour.hour()
        )
    }

    pub async fn fetch_hour(&self, url: &str) -> Result<HourFetch, FetchError> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(HourFetch::NotPublished);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(super::graphql::classify_status(status, None, &message));
        }

        let bytes = response.bytes().await?;
        let candidates = tokio::task::spawn_blocking(move || -> Result<_, FetchError> {
            let mut decoder = GzDecoder::new(bytes.as_ref());
            let mut raw = String::new();
            decoder
                .read_to_string(&mut raw)
                .map_err(|e| FetchError::Parse(format!("failed to decode archive payload: {e}")))?;
            Ok(count_repo_events(&raw))
        })
        .await
        .map_err(|e| FetchError::Transport(format!("decode task failed: {e}")))??;

        Ok(HourFetch::Candidates(candidates))
    }
}

/// Parse the hour a locator refers to, e.g. `.../2024-06-01-7.json.gz`.
pub fn parse_hour_url(url: &str) -> Option<DateTime<Utc>> {
    let file = url.rsplit('/').next()?.strip_suffix(".json.gz")?;
    let (date, hour) = file.rsplit_once('-')?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let hour: u32 = hour.parse().ok()?;
    let naive = date.and_hms_opt(hour, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Count events per repository in a newline-delimited event dump.
///
/// Malformed lines and events without a numeric `repo.id` are skipped. When a
/// repository appears under several names the last one wins.
pub fn count_repo_events(raw: &str) -> Vec<Candidate> {
    let mut activity: HashMap<i64, (String, i64)> = HashMap::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(error = %err, "skip malformed archive line");
                continue;
            }
        };
        let Some(repo) = event.get("repo") else {
            continue;
        };
        let (Some(id), Some(name)) = (
            repo.get("id").and_then(Value::as_i64),
            repo.get("name").and_then(Value::as_str),
        ) else {
            continue;
        };
        let entry = activity.entry(id).or_insert_with(|| (String::new(), 0));
        entry.0 = name.to_string();
        entry.1 += 1;
    }

    let mut candidates: Vec<Candidate> = activity
        .into_iter()
        .map(|(id, (name, count))| Candidate::new(id, name, count))
        .collect();
    candidates.sort_by_key(|c| c.external_id);
    candidates
}
