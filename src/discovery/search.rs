use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use super::{CandidateSink, DiscoveryError, DiscoverySource};
use crate::github::SearchClient;

/// Walks repository creation dates one window per pass.
///
/// The cursor starts `lookback_days` before today, advances only after a
/// window was searched successfully, and wraps back to the start once it
/// passes today.
pub struct SearchSource {
    client: SearchClient,
    start: NaiveDate,
    cursor: Mutex<NaiveDate>,
    window_days: u32,
    min_stars: u32,
}

impl SearchSource {
    pub fn new(client: SearchClient, lookback_days: u32, window_days: u32, min_stars: u32) -> Self {
        let start = Utc::now().date_naive() - chrono::Duration::days(i64::from(lookback_days));
        Self::starting_at(client, start, window_days, min_stars)
    }

    pub fn starting_at(
        client: SearchClient,
        start: NaiveDate,
        window_days: u32,
        min_stars: u32,
    ) -> Self {
        Self {
            client,
            start,
            cursor: Mutex::new(start),
            window_days: window_days.max(1),
            min_stars,
        }
    }

    /// The next `[start, end]` window, both inclusive.
    pub(crate) fn window(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let mut cursor = self.cursor.lock().unwrap_or_else(|p| p.into_inner());
        if *cursor > today {
            *cursor = self.start;
        }
        let begin = *cursor;
        let end = (begin + chrono::Duration::days(i64::from(self.window_days) - 1)).min(today);
        (begin, end)
    }

    pub(crate) fn advance_past(&self, end: NaiveDate) {
        let mut cursor = self.cursor.lock().unwrap_or_else(|p| p.into_inner());
        *cursor = end + chrono::Duration::days(1);
    }
}

#[async_trait]
impl DiscoverySource for SearchSource {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn discover(&self, sink: &mut CandidateSink) -> Result<(), DiscoveryError> {
        let (begin, end) = self.window(Utc::now().date_naive());
        let candidates = self.client.search_window(begin, end, self.min_stars).await?;
        tracing::info!(
            window_start = %begin,
            window_end = %end,
            found = candidates.len(),
            "Searched creation window"
        );
        sink.extend(candidates).await?;
        self.advance_past(end);
        Ok(())
    }
}
