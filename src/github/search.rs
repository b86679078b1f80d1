//! Repository search by creation window.
//!
//! The Search API caps every query at 1000 results, so discovery walks
//! narrow `created:` windows instead of one broad query.

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;

use super::USER_AGENT;
use crate::error::FetchError;
use crate::queue::Candidate;

const SEARCH_URL: &str = "https://api.github.com/search/repositories";
const PER_PAGE: u32 = 100;
const MAX_PAGES: u32 = 10;

#[derive(Debug, Clone)]
pub struct SearchClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
    page_delay: Duration,
}

impl SearchClient {
    pub fn new(token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint: SEARCH_URL.to_string(),
            token,
            // 30 searches/min when authenticated.
            page_delay: Duration::from_millis(2100),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn build_query(start: NaiveDate, end: NaiveDate, min_stars: u32) -> String {
        format!(
            "created:{}..{} stars:>{}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            min_stars
        )
    }

    /// Page through repositories created in `[start, end]`.
    ///
    /// Pagination stops early on an empty page or when the API rate limits
    /// the client; results gathered so far are returned in that case.
    pub async fn search_window(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        min_stars: u32,
    ) -> Result<Vec<Candidate>, FetchError> {
        let query = Self::build_query(start, end, min_stars);
        let mut candidates = Vec::new();

        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}?q={}&sort=stars&order=desc&per_page={}&page={}",
                self.endpoint,
                urlencoding::encode(&query),
                PER_PAGE,
                page
            );

            let mut request = self
                .client
                .get(&url)
                .header("User-Agent", USER_AGENT)
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28");
            if let Some(ref token) = self.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                if status.as_u16() == 403 || status.as_u16() == 429 {
                    tracing::warn!(
                        status = %status,
                        page = page,
                        "Search rate limited, stopping pagination"
                    );
                    break;
                }
                let message = response.text().await.unwrap_or_default();
                return Err(super::graphql::classify_status(status, None, &message));
            }

            let raw: Value = response.json().await?;
            let items = parse_search_items(&raw);
            if items.is_empty() {
                break;
            }
            let page_len = items.len();
            candidates.extend(items);

            tracing::debug!(
                query = %query,
                page = page,
                items = page_len,
                total = candidates.len(),
                "Search page fetched"
            );

            if page_len < PER_PAGE as usize {
                break;
            }
            tokio::time::sleep(self.page_delay).await;
        }

        Ok(candidates)
    }
}

/// Extract candidates from a search response. Items without a numeric id or
/// a full name are dropped.
pub fn parse_search_items(raw: &Value) -> Vec<Candidate> {
    raw.get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get("id").and_then(Value::as_i64)?;
                    let name = item.get("full_name").and_then(Value::as_str)?;
                    Some(Candidate::new(id, name, 1))
                })
                .collect()
        })
        .unwrap_or_default()
}
