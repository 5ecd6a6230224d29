//! Cached summaries, comparisons and insight snapshots.
//!
//! Every artifact is keyed by a hash of its inputs plus [`PROMPT_SCHEMA_VERSION`].
//! A matching cache entry is returned without contacting the backend; a
//! mismatched one is regenerated and overwritten, never served.

use super::llm::{ChatMessage, ChatRequest, LlmBackend};
use super::prompts::{
    comparison_prompt, excerpt, insight_prompt, summary_prompt, COMPARISON_SYSTEM_PROMPT,
    INSIGHT_SYSTEM_PROMPT, PROMPT_SCHEMA_VERSION, SUMMARY_SYSTEM_PROMPT,
};
use super::response::{parse_comparison, parse_insight, parse_summary};
use super::trending::top_terms;
use crate::config::LlmConfig;
use crate::error::{AnalysisError, PipelineError};
use crate::models::{hash_parts, ComparisonResult, InsightSnapshot, Paper, Summary};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::PaperStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Terms kept in an insight snapshot.
const TOP_TERMS: usize = 10;

pub struct AnalysisEngine {
    backend: Arc<dyn LlmBackend>,
    retry: RetryPolicy,
    temperature: f32,
    max_tokens: u32,
    max_insight_papers: usize,
    request_interval: std::time::Duration,
    last_request: Mutex<Option<Instant>>,
}

/// Cache key of a paper's summary.
pub fn summary_cache_key(paper: &Paper) -> String {
    hash_parts([paper.content_hash().as_str(), PROMPT_SCHEMA_VERSION])
}

/// Version of a comparison; the pair must already be in id order.
pub fn comparison_version(first: &Paper, second: &Paper) -> String {
    hash_parts([
        first.content_hash().as_str(),
        second.content_hash().as_str(),
        PROMPT_SCHEMA_VERSION,
    ])
}

/// Hash of an insight's input set, independent of the order papers are listed in.
pub fn paper_set_hash(papers: &[Paper]) -> String {
    let mut entries: Vec<(String, String)> = papers
        .iter()
        .map(|p| (p.id.clone(), p.content_hash()))
        .collect();
    entries.sort();

    let mut parts: Vec<String> = vec![PROMPT_SCHEMA_VERSION.to_string()];
    for (id, hash) in entries {
        parts.push(id);
        parts.push(hash);
    }
    hash_parts(parts)
}

fn ordered<'a>(paper_a: &'a Paper, paper_b: &'a Paper) -> (&'a Paper, &'a Paper) {
    if paper_a.id < paper_b.id {
        (paper_a, paper_b)
    } else {
        (paper_b, paper_a)
    }
}

impl AnalysisEngine {
    pub fn new(backend: Arc<dyn LlmBackend>, config: &LlmConfig) -> Self {
        Self {
            backend,
            retry: config.retry_policy(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_insight_papers: config.max_insight_papers.max(1),
            request_interval: std::time::Duration::from_millis(config.request_interval_ms),
            last_request: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// Wait until the minimum spacing since the previous call has passed.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.request_interval {
                tokio::time::sleep(self.request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Call the backend and parse the reply, retrying transient and invalid responses.
    async fn request<T>(
        &self,
        label: &str,
        system: &str,
        user: String,
        parse: fn(&str) -> Result<T, AnalysisError>,
    ) -> Result<T, AnalysisError> {
        let request = ChatRequest {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let result = with_retry(&self.retry, label, || async {
            self.pace().await;
            let raw = self.backend.complete(&request).await?;
            parse(&raw)
        })
        .await;

        result.map_err(|exhausted| AnalysisError::Unavailable {
            attempts: exhausted.attempts,
            last: Box::new(exhausted.error),
        })
    }

    /// Summary of `paper`, from cache when its content is unchanged.
    pub async fn summarize(
        &self,
        paper: &Paper,
        shard: &PaperStore,
    ) -> Result<Summary, PipelineError> {
        let cache_key = summary_cache_key(paper);
        if let Some(cached) = shard.cached_summary(&paper.id, &cache_key)? {
            debug!("Summary cache hit for {}", paper.id);
            return Ok(cached);
        }

        let label = format!("summary of {}", paper.id);
        let fields = self
            .request(&label, SUMMARY_SYSTEM_PROMPT, summary_prompt(paper), parse_summary)
            .await?;

        let summary = Summary {
            paper_id: paper.id.clone(),
            text: fields.text,
            key_points: fields.key_points,
            tags: fields.tags,
            cache_key,
            model: self.model().to_string(),
            generated_at: Utc::now(),
        };
        shard.store_summary(&summary)?;
        debug!("Summarized {}: {}", paper.id, excerpt(&summary.text));
        Ok(summary)
    }

    /// A comparison cached in `shard` that is still current for both papers.
    pub fn cached_comparison(
        &self,
        paper_a: &Paper,
        paper_b: &Paper,
        shard: &PaperStore,
    ) -> Result<Option<ComparisonResult>, PipelineError> {
        let (first, second) = ordered(paper_a, paper_b);
        let cached = shard.cached_comparison(&first.id, &second.id)?;
        Ok(cached.filter(|c| c.content_version == comparison_version(first, second)))
    }

    /// Comparison of two papers; argument order does not matter.
    pub async fn compare(
        &self,
        paper_a: &Paper,
        paper_b: &Paper,
        shard: &PaperStore,
    ) -> Result<ComparisonResult, PipelineError> {
        if paper_a.id == paper_b.id {
            return Err(PipelineError::InvalidRequest(format!(
                "cannot compare paper {} with itself",
                paper_a.id
            )));
        }
        let (first, second) = ordered(paper_a, paper_b);

        let version = comparison_version(first, second);
        if let Some(cached) = shard.cached_comparison(&first.id, &second.id)? {
            if cached.content_version == version {
                debug!("Comparison cache hit for {} / {}", first.id, second.id);
                return Ok(cached);
            }
            info!(
                "Comparison of {} / {} is stale, regenerating",
                first.id, second.id
            );
        }

        let label = format!("comparison of {} / {}", first.id, second.id);
        let fields = self
            .request(
                &label,
                COMPARISON_SYSTEM_PROMPT,
                comparison_prompt(first, second),
                parse_comparison,
            )
            .await?;

        let result = ComparisonResult {
            paper_a: first.id.clone(),
            paper_b: second.id.clone(),
            content_version: version,
            comparison: fields.comparison,
            similarities: fields.similarities,
            differences: fields.differences,
            model: self.model().to_string(),
            created_at: Utc::now(),
        };
        shard.store_comparison(&result)?;
        Ok(result)
    }

    /// Trend snapshot over papers ingested in the trailing `window_days`.
    pub async fn generate_insights(
        &self,
        keyword: &str,
        window_days: u32,
        shard: &PaperStore,
        now: DateTime<Utc>,
    ) -> Result<InsightSnapshot, PipelineError> {
        if window_days == 0 {
            return Err(PipelineError::InvalidRequest(
                "insight window must be at least 1 day".to_string(),
            ));
        }

        let since = now - Duration::days(i64::from(window_days));
        let papers = shard.ingested_since(since)?;
        let set_hash = paper_set_hash(&papers);

        if let Some(cached) = shard.cached_insight(window_days)? {
            if cached.paper_set_hash == set_hash {
                debug!("Insight cache hit for {:?} ({}d)", keyword, window_days);
                return Ok(cached);
            }
        }

        let terms: Vec<String> = top_terms(&papers, TOP_TERMS)
            .into_iter()
            .map(|t| t.term)
            .collect();

        let snapshot = if papers.is_empty() {
            InsightSnapshot {
                keyword: keyword.to_string(),
                window_days,
                paper_set_hash: set_hash,
                paper_count: 0,
                overview: String::new(),
                trends: Vec::new(),
                highlights: Vec::new(),
                top_terms: terms,
                model: self.model().to_string(),
                generated_at: now,
            }
        } else {
            // `ingested_since` lists newest publications first.
            let selected = &papers[..papers.len().min(self.max_insight_papers)];
            let label = format!("insights for {:?} ({}d)", keyword, window_days);
            let fields = self
                .request(
                    &label,
                    INSIGHT_SYSTEM_PROMPT,
                    insight_prompt(keyword, window_days, selected, &terms),
                    parse_insight,
                )
                .await?;

            InsightSnapshot {
                keyword: keyword.to_string(),
                window_days,
                paper_set_hash: set_hash,
                paper_count: papers.len(),
                overview: fields.overview,
                trends: fields.trends,
                highlights: fields.highlights,
                top_terms: terms,
                model: self.model().to_string(),
                generated_at: now,
            }
        };

        shard.store_insight(&snapshot)?;
        info!(
            "Insights for {:?} ({}d) generated from {} paper(s)",
            keyword, window_days, snapshot.paper_count
        );
        Ok(snapshot)
    }
}
