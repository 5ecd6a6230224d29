//! Entry points used by the CLI.
//!
//! Cross-keyword queries (`search`, `compare`) walk every keyword's shard.
//! On-demand analysis waits for the keyword's lock instead of racing a cycle.

use crate::analysis::{top_terms, TermCount};
use crate::context::AppContext;
use crate::error::{PipelineError, StoreError};
use crate::feed::query::{build_query, Logic};
use crate::models::{
    ArchivedInsight, ComparisonResult, CycleReport, InsightSnapshot, Keyword, Paper,
    SchedulerStatus,
};
use crate::report::{self, Digest, ExportFormat};
use crate::scheduler::Scheduler;
use crate::store::PaperStore;
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Terms listed in an exported digest.
const DIGEST_TERMS: usize = 10;

/// A search result with every keyword whose shard holds the paper.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub paper: Paper,
    pub keywords: Vec<String>,
}

/// A paper as found in one keyword's shard.
struct Located {
    keyword: String,
    shard: Arc<PaperStore>,
    paper: Paper,
}

pub struct PaperService {
    scheduler: Scheduler,
}

impl PaperService {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            scheduler: Scheduler::new(ctx),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn ctx(&self) -> &AppContext {
        self.scheduler.context()
    }

    fn keyword(&self, name: &str) -> Result<Keyword, PipelineError> {
        self.ctx()
            .keywords
            .get(name)?
            .ok_or_else(|| PipelineError::UnknownKeyword(name.to_string()))
    }

    pub async fn run_once(&self, keyword: Option<&str>) -> Result<Vec<CycleReport>, PipelineError> {
        self.scheduler.run_once(keyword).await
    }

    pub fn get_status(&self) -> Result<SchedulerStatus, PipelineError> {
        self.scheduler.status()
    }

    /// Papers matching `query` in any shard, newest publication first.
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>, PipelineError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "search query must not be empty".to_string(),
            ));
        }

        let mut hits: BTreeMap<String, SearchHit> = BTreeMap::new();
        for keyword in self.ctx().keywords.list()? {
            let shard = self.ctx().shards.shard(&keyword.name)?;
            for paper in shard.search(query)? {
                hits.entry(paper.id.clone())
                    .or_insert_with(|| SearchHit {
                        paper,
                        keywords: Vec::new(),
                    })
                    .keywords
                    .push(keyword.name.clone());
            }
        }

        let mut hits: Vec<SearchHit> = hits.into_values().collect();
        hits.sort_by(|a, b| {
            b.paper
                .published_at
                .cmp(&a.paper.published_at)
                .then_with(|| a.paper.id.cmp(&b.paper.id))
        });
        debug!("Search for {:?} matched {} paper(s)", query, hits.len());
        Ok(hits)
    }

    /// Insight snapshot for a keyword's trailing window, regenerated when stale.
    pub async fn get_insights(
        &self,
        keyword: &str,
        days: u32,
    ) -> Result<InsightSnapshot, PipelineError> {
        let analysis = self.ctx().analysis()?;
        let keyword = self.keyword(keyword)?;
        let shard = self.ctx().shards.shard(&keyword.name)?;

        let lock = self.ctx().locks.get(&keyword.name);
        let _guard = lock.lock().await;
        analysis
            .generate_insights(&keyword.name, days, &shard, Utc::now())
            .await
    }

    /// Archived daily snapshots for a keyword's window, newest first.
    pub fn insight_history(
        &self,
        keyword: &str,
        days: u32,
        limit: usize,
    ) -> Result<Vec<ArchivedInsight>, PipelineError> {
        let keyword = self.keyword(keyword)?;
        let shard = self.ctx().shards.shard(&keyword.name)?;
        Ok(shard.insight_history(days, limit)?)
    }

    /// Every shard holding paper `id`, in keyword order.
    fn locate(&self, id: &str) -> Result<Vec<Located>, PipelineError> {
        let mut found = Vec::new();
        for keyword in self.ctx().keywords.list()? {
            let shard = self.ctx().shards.shard(&keyword.name)?;
            if let Some(paper) = shard.get(id)? {
                found.push(Located {
                    keyword: keyword.name,
                    shard,
                    paper,
                });
            }
        }
        Ok(found)
    }

    /// Compare two papers by id.
    ///
    /// A current comparison cached in any shard holding either paper is
    /// reused. Otherwise the result is cached in the first keyword shard
    /// holding both papers, or else in the shard holding the
    /// lexicographically smaller id.
    pub async fn compare(&self, id_a: &str, id_b: &str) -> Result<ComparisonResult, PipelineError> {
        let analysis = self.ctx().analysis()?;
        let (id_a, id_b) = (id_a.trim(), id_b.trim());
        if id_a == id_b {
            return Err(PipelineError::InvalidRequest(format!(
                "cannot compare paper {} with itself",
                id_a
            )));
        }

        let found_a = self.locate(id_a)?;
        let found_b = self.locate(id_b)?;
        let (Some(first_a), Some(first_b)) = (found_a.first(), found_b.first()) else {
            let missing = if found_a.is_empty() { id_a } else { id_b };
            return Err(PipelineError::PaperNotFound(missing.to_string()));
        };

        for located in found_a.iter().chain(found_b.iter()) {
            if let Some(cached) =
                analysis.cached_comparison(&first_a.paper, &first_b.paper, &located.shard)?
            {
                debug!(
                    "Comparison of {} / {} found in {:?}",
                    id_a, id_b, located.keyword
                );
                return Ok(cached);
            }
        }

        let home = found_a
            .iter()
            .find(|a| found_b.iter().any(|b| b.keyword == a.keyword))
            .unwrap_or(if id_a < id_b { first_a } else { first_b });
        debug!("Caching comparison of {} / {} in {:?}", id_a, id_b, home.keyword);

        let lock = self.ctx().locks.get(&home.keyword);
        let _guard = lock.lock().await;
        analysis
            .compare(&first_a.paper, &first_b.paper, &home.shard)
            .await
    }

    pub fn add_keyword(
        &self,
        name: &str,
        terms: &[String],
        logic: Logic,
        categories: &[String],
    ) -> Result<Keyword, PipelineError> {
        let name = name.trim();
        let terms = if terms.is_empty() {
            vec![name.to_string()]
        } else {
            terms.to_vec()
        };
        let query = build_query(name, &terms, logic, categories)?;

        let keyword = self.ctx().keywords.add(name, &query, Utc::now())?;
        info!("Added keyword {:?} ({})", keyword.name, keyword.query);
        Ok(keyword)
    }

    /// Remove a keyword. Its shard file stays on disk.
    pub fn remove_keyword(&self, name: &str) -> Result<(), PipelineError> {
        let lock = self.ctx().locks.get(name);
        let _guard = lock
            .try_lock()
            .map_err(|_| PipelineError::Busy(name.to_string()))?;
        if !self.ctx().keywords.remove(name)? {
            return Err(PipelineError::UnknownKeyword(name.to_string()));
        }
        self.ctx().shards.close(name)?;
        info!("Removed keyword {:?}", name);
        Ok(())
    }

    pub fn set_keyword_active(&self, name: &str, active: bool) -> Result<(), PipelineError> {
        if !self.ctx().keywords.set_active(name, active)? {
            return Err(PipelineError::UnknownKeyword(name.to_string()));
        }
        info!(
            "Keyword {:?} {}",
            name,
            if active { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn list_keywords(&self) -> Result<Vec<Keyword>, PipelineError> {
        Ok(self.ctx().keywords.list()?)
    }

    /// Papers ingested for `keyword` in the trailing `days`, newest publication first.
    pub fn recent(&self, keyword: &str, days: u32) -> Result<Vec<Paper>, PipelineError> {
        if days == 0 {
            return Err(PipelineError::InvalidRequest(
                "window must be at least 1 day".to_string(),
            ));
        }
        let keyword = self.keyword(keyword)?;
        let shard = self.ctx().shards.shard(&keyword.name)?;
        Ok(shard.ingested_since(Utc::now() - Duration::days(i64::from(days)))?)
    }

    /// Most frequent terms in the papers `recent` returns.
    pub fn trending(
        &self,
        keyword: &str,
        days: u32,
        limit: usize,
    ) -> Result<Vec<TermCount>, PipelineError> {
        let papers = self.recent(keyword, days)?;
        Ok(top_terms(&papers, limit))
    }

    /// Digest of recent papers with the cached insight for the same window.
    ///
    /// Never calls the LLM; run a cycle or `get_insights` first for a fresh snapshot.
    pub fn export(
        &self,
        keyword: &str,
        days: u32,
        format: ExportFormat,
    ) -> Result<String, PipelineError> {
        let papers = self.recent(keyword, days)?;
        let shard = self.ctx().shards.shard(keyword)?;

        let digest = Digest {
            keyword: keyword.to_string(),
            window_days: days,
            generated_at: Utc::now(),
            top_terms: top_terms(&papers, DIGEST_TERMS),
            insight: shard.cached_insight(days)?,
            papers,
        };
        report::render(&digest, format).map_err(|e| PipelineError::Store(StoreError::Codec(e)))
    }
}
