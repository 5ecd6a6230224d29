//! Incremental ingestion of one keyword into its shard.
//!
//! Pages are requested in ascending submission order. The watermark only
//! advances over pages that were fully processed before the first failed
//! page, so a failure never hides papers from the next run.

use crate::config::FeedConfig;
use crate::error::StoreError;
use crate::feed::{FeedClient, PageRequest};
use crate::models::{FetchWindow, IngestReport, Keyword, PageFailure};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{KeywordStore, PaperStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct IngestionEngine {
    feed: Arc<dyn FeedClient>,
    keywords: Arc<KeywordStore>,
    page_size: usize,
    max_pages: usize,
    lookback: Duration,
    retry: RetryPolicy,
}

impl IngestionEngine {
    pub fn new(feed: Arc<dyn FeedClient>, keywords: Arc<KeywordStore>, config: &FeedConfig) -> Self {
        Self {
            feed,
            keywords,
            page_size: config.page_size.max(1),
            max_pages: config.max_pages.max(1),
            lookback: Duration::days(i64::from(config.lookback_days)),
            retry: config.retry_policy(),
        }
    }

    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `(last_fetch_at, now]`, or `[now - lookback, now]` for a keyword that never fetched.
    pub fn window_for(&self, keyword: &Keyword, now: DateTime<Utc>) -> FetchWindow {
        match keyword.last_fetch_at {
            Some(watermark) => FetchWindow {
                start: watermark,
                end: now,
                start_inclusive: false,
            },
            None => FetchWindow {
                start: now - self.lookback,
                end: now,
                start_inclusive: true,
            },
        }
    }

    /// Fetch every page of `window`, store new papers and advance the watermark.
    ///
    /// Page failures are collected in the report; only store errors abort.
    pub async fn ingest(
        &self,
        keyword: &Keyword,
        window: FetchWindow,
        shard: &PaperStore,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, StoreError> {
        let mut report = IngestReport {
            keyword: keyword.name.clone(),
            window,
            accepted: Vec::new(),
            skipped_duplicate: 0,
            skipped_out_of_window: 0,
            errors: Vec::new(),
            pages_fetched: 0,
            watermark_before: keyword.last_fetch_at,
            watermark_after: keyword.last_fetch_at,
            cancelled: false,
        };

        info!("Ingesting {:?} over {}", keyword.name, window);
        let ingested_at = Utc::now();
        // Newest timestamp covered by the unbroken prefix of processed pages.
        let mut newest: Option<DateTime<Utc>> = None;

        for page in 0..self.max_pages {
            if cancel.is_cancelled() {
                info!("Ingestion of {:?} cancelled before page {}", keyword.name, page);
                report.cancelled = true;
                break;
            }

            let request = PageRequest {
                query: keyword.query.clone(),
                window,
                start: page * self.page_size,
                max_results: self.page_size,
            };
            let label = format!("feed page {} for {:?}", page, keyword.name);
            let fetched = with_retry(&self.retry, &label, || self.feed.fetch_page(&request)).await;

            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(exhausted) => {
                    warn!(
                        "Giving up on page {} for {:?} after {} attempt(s): {}",
                        page, keyword.name, exhausted.attempts, exhausted.error
                    );
                    report.errors.push(PageFailure {
                        page,
                        error: exhausted.error,
                    });
                    continue;
                }
            };

            report.pages_fetched += 1;
            let before_failure = report.errors.is_empty();

            for item in fetched.items {
                if !window.contains(item.published_at) {
                    report.skipped_out_of_window += 1;
                    continue;
                }
                let published_at = item.published_at;
                let paper = item.into_paper(ingested_at);

                if shard.insert_if_absent(&paper)? {
                    debug!("Accepted {} ({})", paper.id, paper.title);
                    report.accepted.push(paper);
                } else {
                    report.skipped_duplicate += 1;
                }

                if before_failure {
                    newest = newest.max(Some(published_at));
                }
            }

            if fetched.raw_count < self.page_size {
                break;
            }
        }

        let target = if report.is_complete() {
            Some(newest.unwrap_or(window.end))
        } else {
            newest
        };
        if let Some(target) = target {
            if self.keywords.advance_watermark(&keyword.name, target)? {
                report.watermark_after = Some(target);
            }
        }

        info!(
            "Ingested {:?}: {} new, {} duplicate, {} out of window, {} page(s), {} failed page(s)",
            keyword.name,
            report.accepted.len(),
            report.skipped_duplicate,
            report.skipped_out_of_window,
            report.pages_fetched,
            report.errors.len()
        );
        Ok(report)
    }
}
