use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::{CandidateSink, DiscoveryError, DiscoverySource};
use crate::error::with_db_timeout;
use crate::github::archive::parse_hour_url;
use crate::github::{ArchiveClient, HourFetch};
use crate::queue::SourceQueue;

/// Harvests GH Archive hours through the source reference queue.
///
/// Each pass registers every complete hour since the last registered one,
/// claims a few pending hours and fetches them concurrently. An hour is only
/// marked done after its candidates have been flushed to the work queue.
/// Hours that fail transiently are released for a later pass; hours that can
/// never succeed (undecodable payload, rejected request) are marked done so
/// they stop occupying claim slots.
pub struct ArchiveSource {
    client: ArchiveClient,
    refs: SourceQueue,
    lookback_hours: u32,
    hours_per_run: usize,
    concurrency: usize,
}

impl ArchiveSource {
    pub fn new(
        client: ArchiveClient,
        refs: SourceQueue,
        lookback_hours: u32,
        hours_per_run: usize,
    ) -> Self {
        Self {
            client,
            refs,
            lookback_hours,
            hours_per_run,
            concurrency: 8,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Complete hours after `latest` (or the lookback start) up to the hour
/// before `now`.
pub(crate) fn hours_to_register(
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookback_hours: u32,
) -> Vec<DateTime<Utc>> {
    let hour = chrono::Duration::hours(1);
    let current = now.duration_trunc(hour).unwrap_or(now);
    let last_complete = current - hour;
    let mut next = match latest {
        Some(latest) => latest + hour,
        None => current - chrono::Duration::hours(i64::from(lookback_hours)),
    };

    let mut hours = Vec::new();
    while next <= last_complete {
        hours.push(next);
        next += hour;
    }
    hours
}

#[async_trait]
impl DiscoverySource for ArchiveSource {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn discover(&self, sink: &mut CandidateSink) -> Result<(), DiscoveryError> {
        let db_timeout = sink.db_timeout();
        let latest = with_db_timeout("latest_locator", db_timeout, self.refs.latest_locator())
            .await?
            .as_deref()
            .and_then(parse_hour_url);
        let locators: Vec<String> = hours_to_register(latest, Utc::now(), self.lookback_hours)
            .into_iter()
            .map(|hour| self.client.hour_url(hour))
            .collect();
        if !locators.is_empty() {
            let registered = with_db_timeout(
                "register_hours",
                db_timeout,
                self.refs.enqueue_locators(&locators),
            )
            .await?;
            debug!(registered, "Registered archive hours");
        }

        let claimed =
            with_db_timeout("claim_hours", db_timeout, self.refs.claim(self.hours_per_run)).await?;
        if claimed.is_empty() {
            return Ok(());
        }
        let attempted = claimed.len();

        let mut fetches = stream::iter(claimed)
            .map(|reference| async move {
                let started = std::time::Instant::now();
                let result = self.client.fetch_hour(&reference.locator).await;
                (reference.locator, result, started.elapsed())
            })
            .buffer_unordered(self.concurrency);

        let mut failed = 0usize;
        while let Some((locator, result, elapsed)) = fetches.next().await {
            let done = std::slice::from_ref(&locator);
            match result {
                Ok(HourFetch::Candidates(candidates)) => {
                    let repos = candidates.len();
                    sink.extend(candidates).await?;
                    sink.flush().await?;
                    with_db_timeout("mark_hour_done", db_timeout, self.refs.mark_done(done))
                        .await?;
                    info!(
                        hour = %locator,
                        repos,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Harvested archive hour"
                    );
                }
                Ok(HourFetch::NotPublished) => {
                    debug!(hour = %locator, "Archive hour not published yet");
                    with_db_timeout("release_hour", db_timeout, self.refs.release(&locator))
                        .await?;
                }
                Err(err) if err.kind().is_retryable() => {
                    warn!(hour = %locator, error = %err, "Archive hour fetch failed");
                    with_db_timeout("release_hour", db_timeout, self.refs.release(&locator))
                        .await?;
                    failed += 1;
                }
                Err(err) => {
                    warn!(hour = %locator, error = %err, "Archive hour unusable, skipping it");
                    with_db_timeout("mark_hour_done", db_timeout, self.refs.mark_done(done))
                        .await?;
                    failed += 1;
                }
            }
        }

        if failed == attempted {
            return Err(DiscoveryError::Source(format!(
                "all {attempted} claimed archive hours failed"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ArchiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSource")
            .field("lookback_hours", &self.lookback_hours)
            .field("hours_per_run", &self.hours_per_run)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}
