//! Keyword cycles: ingest, summarize pending papers, refresh insights.
//!
//! A cycle holds its keyword's lock for the whole run, so two cycles for the
//! same keyword never overlap. Different keywords run concurrently up to
//! `scheduler.concurrency`.

pub mod trigger;

use crate::context::AppContext;
use crate::error::PipelineError;
use crate::models::{AnalysisFailure, CycleReport, Keyword, KeywordHealth, Phase, SchedulerStatus};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

struct SchedulerState {
    phase: Phase,
    active_runs: usize,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    last_failure: Option<String>,
}

pub struct Scheduler {
    ctx: Arc<AppContext>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(SchedulerState {
                phase: Phase::Idle,
                active_runs: 0,
                last_run: None,
                next_run: None,
                last_failure: None,
            }),
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run one cycle for `keyword`, or for every active keyword.
    ///
    /// An explicitly named keyword whose cycle is already in flight is
    /// rejected with [`PipelineError::Busy`]; in a full run it is skipped.
    pub async fn run_once(&self, keyword: Option<&str>) -> Result<Vec<CycleReport>, PipelineError> {
        self.ctx.analysis()?;

        let Some(name) = keyword else {
            let targets = self.ctx.keywords.active()?;
            return Ok(self.run_all(targets).await);
        };

        let keyword = self
            .ctx
            .keywords
            .get(name)?
            .ok_or_else(|| PipelineError::UnknownKeyword(name.to_string()))?;
        let lock = self.ctx.locks.get(&keyword.name);
        let _guard = lock
            .try_lock_owned()
            .map_err(|_| PipelineError::Busy(keyword.name.clone()))?;

        self.begin();
        let report = self.run_cycle(&keyword).await;
        self.finish(std::slice::from_ref(&report));
        Ok(vec![report])
    }

    async fn run_all(&self, targets: Vec<Keyword>) -> Vec<CycleReport> {
        if targets.is_empty() {
            info!("No active keywords to run");
            return Vec::new();
        }

        self.begin();
        let concurrency = self.ctx.config.scheduler.concurrency.max(1);
        let mut reports: Vec<CycleReport> = stream::iter(targets)
            .map(|keyword| self.try_cycle(keyword))
            .buffer_unordered(concurrency)
            .filter_map(|report| async move { report })
            .collect()
            .await;
        reports.sort_by(|a, b| a.keyword.cmp(&b.keyword));
        self.finish(&reports);
        reports
    }

    /// Run the keyword's cycle unless one is already in flight.
    async fn try_cycle(&self, keyword: Keyword) -> Option<CycleReport> {
        let lock = self.ctx.locks.get(&keyword.name);
        let Ok(_guard) = lock.try_lock_owned() else {
            warn!("Skipping {:?}: a cycle is already in flight", keyword.name);
            return None;
        };
        Some(self.run_cycle(&keyword).await)
    }

    fn begin(&self) {
        let mut state = self.state();
        state.active_runs += 1;
        state.phase = Phase::Running;
    }

    fn finish(&self, reports: &[CycleReport]) {
        let mut state = self.state();
        state.active_runs = state.active_runs.saturating_sub(1);
        state.last_run = Some(Utc::now());

        let failed = reports.iter().any(CycleReport::failed);
        if let Some(reason) = reports.iter().find_map(CycleReport::failure_reason) {
            state.last_failure = Some(reason);
        }
        if state.active_runs == 0 {
            state.phase = if failed { Phase::Failed } else { Phase::Idle };
        }
    }

    /// Run a cycle and record its outcome against the keyword.
    ///
    /// The caller must hold the keyword's lock.
    async fn run_cycle(&self, keyword: &Keyword) -> CycleReport {
        let mut report = CycleReport::started(&keyword.name, Utc::now());

        if let Err(e) = self.cycle_steps(keyword, &mut report).await {
            error!("Cycle for {:?} failed: {}", keyword.name, e);
            report.error = Some(e.to_string());
        }
        report.finished_at = Utc::now();

        let recorded = if report.failed() {
            self.ctx
                .keywords
                .record_failure(
                    &keyword.name,
                    report.finished_at,
                    report.error.as_deref().unwrap_or_default(),
                )
        } else {
            self.ctx.keywords.record_run(
                &keyword.name,
                report.finished_at,
                report.failure_reason().as_deref(),
            )
        };
        if let Err(e) = recorded {
            error!("Failed to record cycle outcome for {:?}: {}", keyword.name, e);
        }

        info!(
            "Cycle for {:?} finished: {} new, {} summarized, {} analysis failure(s), insights {:?}",
            keyword.name,
            report.accepted,
            report.summarized,
            report.analysis_failures.len(),
            report.insights_refreshed
        );
        report
    }

    async fn cycle_steps(
        &self,
        keyword: &Keyword,
        report: &mut CycleReport,
    ) -> Result<(), PipelineError> {
        let analysis = self.ctx.analysis()?;
        let shard = self.ctx.shards.shard(&keyword.name)?;
        let cancel = &self.ctx.cancel;

        let window = self.ctx.ingestion.window_for(keyword, Utc::now());
        let ingested = self.ctx.ingestion.ingest(keyword, window, &shard, cancel).await?;
        report.accepted = ingested.accepted.len();
        report.skipped_duplicate = ingested.skipped_duplicate;
        report.page_failures = ingested
            .errors
            .iter()
            .map(|f| format!("page {}: {}", f.page, f.error))
            .collect();
        report.watermark = ingested.watermark_after;
        if ingested.watermark_after != ingested.watermark_before {
            debug!(
                "Watermark for {:?} advanced over {}",
                ingested.keyword, ingested.window
            );
        }
        if ingested.cancelled {
            return Err(PipelineError::Cancelled);
        }

        // Newly accepted papers plus any left over from earlier failed runs.
        let pending = shard.pending_analysis(usize::MAX)?;
        debug!("{} paper(s) awaiting analysis for {:?}", pending.len(), keyword.name);
        for paper in &pending {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match analysis.summarize(paper, &shard).await {
                Ok(_) => report.summarized += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Analysis of {} failed: {}", paper.id, e);
                    report.analysis_failures.push(AnalysisFailure {
                        paper_id: paper.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let now = Utc::now();
        for &days in &self.ctx.config.scheduler.insight_windows {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match analysis
                .generate_insights(&keyword.name, days, &shard, now)
                .await
            {
                Ok(snapshot) => {
                    shard.archive_insight(&snapshot, now)?;
                    report.insights_refreshed.push(days);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Insights for {:?} ({}d) failed: {}", keyword.name, days, e);
                    report.insight_failures.push(format!("{}d: {}", days, e));
                }
            }
        }
        Ok(())
    }

    /// Run keywords that missed a trigger while the process was down.
    pub async fn catch_up(&self, now: DateTime<Utc>) -> Result<Vec<CycleReport>, PipelineError> {
        let scheduler = &self.ctx.config.scheduler;
        let at = scheduler.trigger_time()?;
        let due: Vec<Keyword> = self
            .ctx
            .keywords
            .active()?
            .into_iter()
            .filter(|k| {
                trigger::is_due(
                    k.last_run_at,
                    now,
                    at,
                    scheduler.period(),
                    scheduler.catch_up_on_start,
                )
            })
            .collect();

        if due.is_empty() {
            debug!("No missed runs to catch up");
            return Ok(Vec::new());
        }

        self.ctx.analysis()?;
        info!("Catching up {} keyword(s) that missed a run", due.len());
        Ok(self.run_all(due).await)
    }

    /// Catch up, then run every active keyword at the daily trigger until cancelled.
    pub async fn run_forever(&self) -> Result<(), PipelineError> {
        let at = self.ctx.config.scheduler.trigger_time()?;
        self.ctx.analysis()?;

        self.catch_up(Utc::now()).await?;

        loop {
            let now = Utc::now();
            let next = trigger::next_after(now, at);
            self.state().next_run = Some(next);
            info!("Next run at {}", next.format("%Y-%m-%d %H:%M UTC"));

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.run_once(None).await {
                error!("Scheduled run failed: {}", e);
            }
        }

        self.state().next_run = None;
        Ok(())
    }

    /// Scheduler phase plus per-keyword health.
    ///
    /// `last_run` and `last_failure` fall back to what the keyword store
    /// recorded, so a fresh process still reports earlier cycles.
    pub fn status(&self) -> Result<SchedulerStatus, PipelineError> {
        let stored_failure = self.ctx.keywords.latest_error()?;
        let mut keywords = Vec::new();
        for keyword in self.ctx.keywords.list()? {
            let shard = self.ctx.shards.shard(&keyword.name)?;
            keywords.push(KeywordHealth {
                in_flight: self.ctx.locks.is_held(&keyword.name),
                paper_count: shard.count()?,
                pending_analysis: shard.pending_count()?,
                active: keyword.active,
                watermark: keyword.last_fetch_at,
                last_run_at: keyword.last_run_at,
                last_error: keyword.last_error,
                keyword: keyword.name,
            });
        }

        let stored_last_run = keywords.iter().filter_map(|k| k.last_run_at).max();

        let state = self.state();
        let next_run = match state.next_run {
            Some(next) => Some(next),
            None => self
                .ctx
                .config
                .scheduler
                .trigger_time()
                .ok()
                .map(|at| trigger::next_after(Utc::now(), at)),
        };
        Ok(SchedulerStatus {
            phase: state.phase.clone(),
            last_run: state.last_run.max(stored_last_run),
            next_run,
            last_failure: state.last_failure.clone().or(stored_failure),
            keywords,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::LlmBackend;
    use crate::config::Config;
    use crate::error::ConfigError;
    use crate::models::FeedItem;
    use crate::store::{KeywordStore, ShardRegistry};
    use crate::testing::{feed_item, now_micros, FakeFeed, FakeLlm};
    use chrono::Duration;

    const KEYWORD: &str = "materials science";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.feed.retries = 2;
        config.feed.initial_backoff_ms = 0;
        config.llm.retries = 2;
        config.llm.initial_backoff_ms = 0;
        config.llm.request_interval_ms = 0;
        config
    }

    fn three_papers() -> Vec<FeedItem> {
        let now = now_micros();
        vec![
            feed_item("2406.00001", "Alloys", now - Duration::hours(3)),
            feed_item("2406.00002", "Ceramics", now - Duration::hours(2)),
            feed_item("2406.00003", "Polymers", now - Duration::hours(1)),
        ]
    }

    fn scheduler_with(feed: Arc<FakeFeed>, llm: Arc<FakeLlm>) -> Scheduler {
        let ctx = AppContext::assemble(
            test_config(),
            KeywordStore::in_memory().unwrap(),
            ShardRegistry::in_memory(),
            feed,
            Ok(llm as Arc<dyn LlmBackend>),
        )
        .unwrap();
        Scheduler::new(Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_cycle_ingests_summarizes_and_caches() {
        let feed = Arc::new(FakeFeed::new(three_papers()));
        let llm = Arc::new(FakeLlm::new());
        let scheduler = scheduler_with(feed.clone(), llm.clone());

        let reports = scheduler.run_once(Some(KEYWORD)).await.unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert!(!report.failed());
        assert_eq!(report.accepted, 3);
        assert_eq!(report.summarized, 3);
        assert_eq!(report.insights_refreshed, vec![1, 7, 30]);
        // Three summaries plus one insight call per window.
        assert_eq!(llm.calls(), 6);

        let first_request = &feed.requests()[0];
        assert!(first_request.window.start_inclusive);
        assert_eq!(first_request.query, "all:\"materials science\"");

        let again = scheduler.run_once(Some(KEYWORD)).await.unwrap();
        assert_eq!(again[0].accepted, 0);
        assert_eq!(again[0].summarized, 0);
        assert_eq!(llm.calls(), 6);
        assert!(!feed.requests().last().unwrap().window.start_inclusive);

        let shard = scheduler.context().shards.shard(KEYWORD).unwrap();
        assert_eq!(shard.count().unwrap(), 3);
        assert_eq!(shard.pending_count().unwrap(), 0);

        // Both runs fall on the same day, so each window keeps one entry.
        let history = shard.insight_history(7, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].snapshot.paper_count, 3);
        assert_eq!(history[0].generated_on, Utc::now().date_naive());
        assert_eq!(shard.insight_history(30, 10).unwrap().len(), 1);

        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert!(keyword.last_run_at.is_some());
        assert!(keyword.last_error.is_none());
    }

    #[tokio::test]
    async fn test_analysis_failure_is_isolated_per_paper() {
        let mut items = three_papers();
        items[1].authors = vec!["Flaky Author".to_string()];
        let feed = Arc::new(FakeFeed::new(items));
        let llm = Arc::new(FakeLlm::new());
        llm.time_out_on("Flaky Author");
        let scheduler = scheduler_with(feed, llm.clone());

        let report = scheduler.run_once(Some(KEYWORD)).await.unwrap().remove(0);
        assert!(!report.failed());
        assert_eq!(report.accepted, 3);
        assert_eq!(report.summarized, 2);
        assert_eq!(report.analysis_failures.len(), 1);
        assert_eq!(report.analysis_failures[0].paper_id, "2406.00002");
        assert_eq!(report.insights_refreshed, vec![1, 7, 30]);

        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert!(keyword.last_run_at.is_some());
        assert!(keyword
            .last_error
            .unwrap()
            .contains("analysis unavailable for 1 paper(s)"));

        let status = scheduler.status().unwrap();
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.keywords[0].pending_analysis, 1);
        assert_eq!(status.keywords[0].emoji(), "🔴");
    }

    #[tokio::test]
    async fn test_status_reads_history_from_store() {
        let mut items = three_papers();
        items[0].authors = vec!["Flaky Author".to_string()];
        let llm = Arc::new(FakeLlm::new());
        llm.time_out_on("Flaky Author");
        let scheduler = scheduler_with(Arc::new(FakeFeed::new(items)), llm);
        scheduler.run_once(Some(KEYWORD)).await.unwrap();

        // A new process sees no in-memory history.
        let fresh = Scheduler::new(Arc::clone(scheduler.context()));
        let status = fresh.status().unwrap();
        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert_eq!(status.phase, Phase::Idle);
        assert!(status.last_run.is_some());
        assert_eq!(status.last_run, keyword.last_run_at);
        assert!(status
            .last_failure
            .unwrap()
            .contains("analysis unavailable for 1 paper(s)"));
    }

    #[tokio::test]
    async fn test_store_failure_aborts_cycle_until_repaired() {
        let llm = Arc::new(FakeLlm::new());
        let scheduler = scheduler_with(Arc::new(FakeFeed::new(three_papers())), llm.clone());
        let shard = scheduler.context().shards.shard(KEYWORD).unwrap();
        shard
            .execute_batch("ALTER TABLE papers RENAME TO papers_offline;")
            .unwrap();

        let report = scheduler.run_once(Some(KEYWORD)).await.unwrap().remove(0);
        assert!(report.failed());
        assert!(report.error.as_deref().unwrap().starts_with("sqlite error"));
        assert_eq!(llm.calls(), 0);

        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert!(keyword.last_fetch_at.is_none());
        assert!(keyword.last_run_at.is_none());
        assert_eq!(keyword.last_error, report.error);

        shard
            .execute_batch("ALTER TABLE papers_offline RENAME TO papers;")
            .unwrap();
        assert_eq!(scheduler.status().unwrap().phase, Phase::Failed);
        let report = scheduler.run_once(Some(KEYWORD)).await.unwrap().remove(0);
        assert!(!report.failed());
        assert_eq!(report.accepted, 3);

        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert!(keyword.last_fetch_at.is_some());
        assert!(keyword.last_run_at.is_some());
        assert!(keyword.last_error.is_none());
        assert_eq!(scheduler.status().unwrap().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_between_papers_keeps_finished_summaries() {
        let llm = Arc::new(FakeLlm::new());
        let scheduler = scheduler_with(Arc::new(FakeFeed::new(three_papers())), llm.clone());
        llm.cancel_after(1, scheduler.context().cancel.clone());

        let report = scheduler.run_once(Some(KEYWORD)).await.unwrap().remove(0);
        assert!(report.failed());
        assert_eq!(report.error.as_deref(), Some("cycle cancelled"));
        assert_eq!(report.accepted, 3);
        assert_eq!(report.summarized, 1);
        assert_eq!(llm.calls(), 1);

        let shard = scheduler.context().shards.shard(KEYWORD).unwrap();
        assert!(shard.get("2406.00001").unwrap().unwrap().summary.is_some());
        assert_eq!(shard.pending_count().unwrap(), 2);
        assert!(shard.insight_history(7, 10).unwrap().is_empty());

        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert!(keyword.last_run_at.is_none());
        assert!(keyword.last_fetch_at.is_some());
    }

    #[tokio::test]
    async fn test_busy_keyword_is_rejected() {
        let scheduler = scheduler_with(
            Arc::new(FakeFeed::new(three_papers())),
            Arc::new(FakeLlm::new()),
        );
        let guard = scheduler.context().locks.get(KEYWORD).lock_owned().await;

        let err = scheduler.run_once(Some(KEYWORD)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Busy(ref k) if k == KEYWORD));
        assert!(scheduler.run_once(None).await.unwrap().is_empty());
        assert!(scheduler.status().unwrap().keywords[0].in_flight);

        drop(guard);
        assert_eq!(scheduler.run_once(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_keyword_and_missing_credential() {
        let scheduler = scheduler_with(Arc::new(FakeFeed::new(vec![])), Arc::new(FakeLlm::new()));
        let err = scheduler.run_once(Some("quantum")).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownKeyword(_)));

        let feed = Arc::new(FakeFeed::new(three_papers()));
        let ctx = AppContext::assemble(
            test_config(),
            KeywordStore::in_memory().unwrap(),
            ShardRegistry::in_memory(),
            feed.clone(),
            Err(ConfigError::MissingCredential("DEEPSEEK_API_KEY".to_string())),
        )
        .unwrap();
        let scheduler = Scheduler::new(Arc::new(ctx));
        let err = scheduler.run_once(None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::MissingCredential(_))
        ));
        assert_eq!(feed.request_count(), 0);
    }

    #[tokio::test]
    async fn test_page_failure_keeps_partial_progress() {
        let feed = Arc::new(FakeFeed::new(three_papers()));
        feed.fail_page(0, u32::MAX);
        let scheduler = scheduler_with(feed.clone(), Arc::new(FakeLlm::new()));

        let report = scheduler.run_once(Some(KEYWORD)).await.unwrap().remove(0);
        assert!(!report.failed());
        assert_eq!(report.page_failures.len(), 1);
        assert_eq!(report.accepted, 0);
        assert!(report.watermark.is_none());

        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert!(keyword.last_fetch_at.is_none());
        assert!(keyword.last_error.unwrap().contains("feed page(s) failed"));

        feed.clear_failures();
        let report = scheduler.run_once(Some(KEYWORD)).await.unwrap().remove(0);
        assert_eq!(report.accepted, 3);
        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert!(keyword.last_error.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_cycle_leaves_last_run_untouched() {
        let scheduler = scheduler_with(
            Arc::new(FakeFeed::new(three_papers())),
            Arc::new(FakeLlm::new()),
        );
        scheduler.context().cancel.cancel();

        let report = scheduler.run_once(Some(KEYWORD)).await.unwrap().remove(0);
        assert!(report.failed());
        assert_eq!(report.error.as_deref(), Some("cycle cancelled"));

        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        assert!(keyword.last_run_at.is_none());
        assert!(keyword.last_fetch_at.is_none());

        let status = scheduler.status().unwrap();
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.last_failure.as_deref(), Some("cycle cancelled"));
    }

    #[tokio::test]
    async fn test_catch_up_runs_only_missed_keywords() {
        let llm = Arc::new(FakeLlm::new());
        let scheduler = scheduler_with(Arc::new(FakeFeed::new(three_papers())), llm.clone());

        let reports = scheduler.catch_up(Utc::now()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].accepted, 3);

        let reports = scheduler.catch_up(Utc::now()).await.unwrap();
        assert!(reports.is_empty());

        // A day later the keyword is due again.
        let later = Utc::now() + Duration::hours(25);
        let keyword = scheduler.context().keywords.get(KEYWORD).unwrap().unwrap();
        let at = scheduler.context().config.scheduler.trigger_time().unwrap();
        assert!(trigger::is_due(
            keyword.last_run_at,
            later,
            at,
            scheduler.context().config.scheduler.period(),
            true
        ));
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_cancel() {
        let scheduler = scheduler_with(Arc::new(FakeFeed::new(vec![])), Arc::new(FakeLlm::new()));
        scheduler.context().cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(5), scheduler.run_forever())
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert!(scheduler.status().unwrap().next_run.is_some());
    }
}
