//! Data models for the paper pipeline.
//!
//! This module contains the core records that flow between the feed,
//! the shards, the analysis engine and the scheduler.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Field separator used when hashing composite values.
const HASH_SEPARATOR: &[u8] = &[0x1f];

/// Hex-encoded SHA-256 over the given parts, separated so that
/// `["ab", "c"]` and `["a", "bc"]` hash differently.
pub fn hash_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
        hasher.update(HASH_SEPARATOR);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// One entry of an upstream feed page, before it is accepted into a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    /// Stable upstream identifier (version suffix removed).
    pub id: String,
    pub title: String,
    pub abstract_text: String,
    /// Ordered as listed by the feed.
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub pdf_url: String,
}

impl FeedItem {
    /// Turn a feed candidate into a paper record ingested at `ingested_at`.
    pub fn into_paper(self, ingested_at: DateTime<Utc>) -> Paper {
        let mut categories = self.categories;
        categories.sort();
        categories.dedup();

        Paper {
            id: self.id,
            title: self.title,
            abstract_text: self.abstract_text,
            authors: self.authors,
            categories,
            published_at: self.published_at,
            ingested_at,
            pdf_url: self.pdf_url,
            summary: None,
            insight_tags: Vec::new(),
        }
    }
}

/// A paper stored in a keyword shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub authors: Vec<String>,
    /// Category tags, sorted and unique.
    pub categories: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub pdf_url: String,
    /// Cached summary text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Cached insight tags from the summary pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insight_tags: Vec<String>,
}

impl Paper {
    /// Hash of the fields a summary is derived from.
    pub fn content_hash(&self) -> String {
        let authors = self.authors.join(", ");
        let categories = self.categories.join(", ");
        hash_parts([
            self.id.as_str(),
            self.title.as_str(),
            self.abstract_text.as_str(),
            authors.as_str(),
            categories.as_str(),
        ])
    }

    /// Summary if present, otherwise the abstract truncated to `max_chars`.
    pub fn digest_text(&self, max_chars: usize) -> String {
        match &self.summary {
            Some(summary) => summary.clone(),
            None => truncate_chars(&self.abstract_text, max_chars),
        }
    }
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// A search term and its ingestion bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub name: String,
    /// Feed search expression built from the keyword's terms.
    pub query: String,
    pub active: bool,
    /// Watermark: ingestion is known complete up to this instant.
    pub last_fetch_at: Option<DateTime<Utc>>,
    /// Last completed cycle (success or partial).
    pub last_run_at: Option<DateTime<Utc>>,
    /// Most recent failure reason, cleared by a clean cycle.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The half-open fetch window `(start, end]`, or `[start, end]` on a first run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Whether `start` itself belongs to the window (first run look-back).
    pub start_inclusive: bool,
}

impl FetchWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let after_start = if self.start_inclusive {
            at >= self.start
        } else {
            at > self.start
        };
        after_start && at <= self.end
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} .. {}]",
            if self.start_inclusive { "[" } else { "(" },
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Normalized result of a summary call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub paper_id: String,
    pub text: String,
    pub key_points: Vec<String>,
    pub tags: Vec<String>,
    /// Content hash plus schema version this summary was generated for.
    pub cache_key: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

/// Cached comparison of an unordered pair of papers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Lexicographically smaller id of the pair.
    pub paper_a: String,
    /// Lexicographically larger id of the pair.
    pub paper_b: String,
    pub content_version: String,
    pub comparison: String,
    pub similarities: Vec<String>,
    pub differences: Vec<String>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Cached trend summary over a keyword's recent papers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSnapshot {
    pub keyword: String,
    pub window_days: u32,
    /// Hash of the selected paper set; equal hashes mean a cache hit.
    pub paper_set_hash: String,
    pub paper_count: usize,
    pub overview: String,
    pub trends: Vec<String>,
    pub highlights: Vec<String>,
    /// Locally computed frequent terms.
    pub top_terms: Vec<String>,
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

/// An insight snapshot as it stood at the end of one day's cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedInsight {
    pub generated_on: NaiveDate,
    pub snapshot: InsightSnapshot,
}

/// A page that could not be fetched after retries.
#[derive(Debug, Clone)]
pub struct PageFailure {
    /// 0-based page index within the run.
    pub page: usize,
    pub error: crate::error::FetchError,
}

/// Result of one ingestion pass over a keyword.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub keyword: String,
    pub window: FetchWindow,
    pub accepted: Vec<Paper>,
    pub skipped_duplicate: usize,
    pub skipped_out_of_window: usize,
    pub errors: Vec<PageFailure>,
    pub pages_fetched: usize,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

/// Per-paper analysis failure surfaced without failing the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub paper_id: String,
    pub reason: String,
}

/// Outcome of one keyword's ingest → analyze → insight cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub keyword: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accepted: usize,
    pub skipped_duplicate: usize,
    pub page_failures: Vec<String>,
    pub summarized: usize,
    pub analysis_failures: Vec<AnalysisFailure>,
    pub insights_refreshed: Vec<u32>,
    pub insight_failures: Vec<String>,
    pub watermark: Option<DateTime<Utc>>,
    /// Fatal error that aborted the cycle.
    pub error: Option<String>,
}

impl CycleReport {
    pub fn started(keyword: &str, at: DateTime<Utc>) -> Self {
        Self {
            keyword: keyword.to_string(),
            started_at: at,
            finished_at: at,
            accepted: 0,
            skipped_duplicate: 0,
            page_failures: Vec::new(),
            summarized: 0,
            analysis_failures: Vec::new(),
            insights_refreshed: Vec::new(),
            insight_failures: Vec::new(),
            watermark: None,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Most relevant failure reason, if any, for keyword health.
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(ref error) = self.error {
            return Some(error.clone());
        }
        if let Some(first) = self.page_failures.first() {
            return Some(format!(
                "{} feed page(s) failed: {}",
                self.page_failures.len(),
                first
            ));
        }
        if let Some(first) = self.analysis_failures.first() {
            return Some(format!(
                "analysis unavailable for {} paper(s): {}: {}",
                self.analysis_failures.len(),
                first.paper_id,
                first.reason
            ));
        }
        self.insight_failures
            .first()
            .map(|first| format!("insight generation failed: {}", first))
    }
}

/// Scheduler state machine phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Running => write!(f, "Running"),
            Phase::Failed => write!(f, "Failed"),
        }
    }
}

/// Health of a single keyword pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordHealth {
    pub keyword: String,
    pub active: bool,
    pub in_flight: bool,
    pub watermark: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub paper_count: usize,
    pub pending_analysis: usize,
}

impl KeywordHealth {
    /// Returns an emoji representation of the keyword's health.
    pub fn emoji(&self) -> &'static str {
        if self.in_flight {
            "🔄"
        } else if self.last_error.is_some() {
            "🔴"
        } else if self.last_run_at.is_none() {
            "⚪"
        } else {
            "🟢"
        }
    }
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub phase: Phase,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub keywords: Vec<KeywordHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_item() -> FeedItem {
        FeedItem {
            id: "2401.00001".to_string(),
            title: "Graph Networks for Crystals".to_string(),
            abstract_text: "We predict properties.".to_string(),
            authors: vec!["Ada".to_string(), "Grace".to_string()],
            categories: vec!["cs.LG".to_string(), "cond-mat".to_string(), "cs.LG".to_string()],
            published_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            pdf_url: "https://arxiv.org/pdf/2401.00001".to_string(),
        }
    }

    #[test]
    fn test_hash_parts_is_separator_aware() {
        assert_ne!(hash_parts(["ab", "c"]), hash_parts(["a", "bc"]));
        assert_eq!(hash_parts(["x"]).len(), 64);
    }

    #[test]
    fn test_into_paper_normalizes_categories() {
        let now = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let paper = sample_item().into_paper(now);
        assert_eq!(paper.categories, vec!["cond-mat", "cs.LG"]);
        assert_eq!(paper.authors, vec!["Ada", "Grace"]);
        assert_eq!(paper.ingested_at, now);
        assert!(paper.summary.is_none());
    }

    #[test]
    fn test_content_hash_ignores_cache_fields() {
        let now = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let paper = sample_item().into_paper(now);
        let mut summarized = paper.clone();
        summarized.summary = Some("cached".to_string());
        summarized.insight_tags = vec!["gnn".to_string()];
        assert_eq!(paper.content_hash(), summarized.content_hash());

        let mut edited = paper.clone();
        edited.abstract_text.push_str(" Revised.");
        assert_ne!(paper.content_hash(), edited.content_hash());
    }

    #[test]
    fn test_window_bounds() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let incremental = FetchWindow {
            start,
            end,
            start_inclusive: false,
        };
        assert!(!incremental.contains(start));
        assert!(incremental.contains(end));

        let first_run = FetchWindow {
            start_inclusive: true,
            ..incremental
        };
        assert!(first_run.contains(start));
        assert!(!first_run.contains(end + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("材料科学研究", 2), "材料…");
    }

    #[test]
    fn test_cycle_failure_reason_priority() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut report = CycleReport::started("ml", at);
        assert!(report.failure_reason().is_none());

        report.analysis_failures.push(AnalysisFailure {
            paper_id: "1".to_string(),
            reason: "timeout".to_string(),
        });
        assert!(report.failure_reason().unwrap().contains("analysis unavailable"));

        report.error = Some("disk full".to_string());
        assert_eq!(report.failure_reason().as_deref(), Some("disk full"));
    }
}
