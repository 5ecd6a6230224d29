//! arXiv Atom API client.

use super::query::windowed_query;
use super::{FeedClient, FeedPage, PageRequest};
use crate::config::FeedConfig;
use crate::error::FetchError;
use crate::models::{truncate_chars, FeedItem};
use async_trait::async_trait;
use feed_rs::model::Entry;
use std::time::Duration;
use tracing::{debug, warn};

/// Marker in the id of the pseudo-entry arXiv returns for a rejected query.
const ERROR_ENTRY_MARKER: &str = "/api/errors";

pub struct ArxivClient {
    http: reqwest::Client,
    base_url: String,
    timeout_seconds: u64,
}

impl ArxivClient {
    pub fn new(config: &FeedConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            timeout_seconds: config.timeout_seconds,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout_seconds)
        } else if e.is_connect() {
            FetchError::Transport(format!("cannot connect to {}", self.base_url))
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl FeedClient for ArxivClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
        let search_query = windowed_query(&request.query, &request.window);
        debug!(
            start = request.start,
            max_results = request.max_results,
            "GET {} search_query={}",
            self.base_url,
            search_query
        );

        let params = [
            ("search_query", search_query),
            ("start", request.start.to_string()),
            ("max_results", request.max_results.to_string()),
            ("sortBy", "submittedDate".to_string()),
            ("sortOrder", "ascending".to_string()),
        ];

        let response = self
            .http
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status,
                body: truncate_chars(body.trim(), 300),
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.map_send_error(e))?;
        parse_page(&bytes)
    }
}

/// Parse an Atom response body into a page of candidates.
pub fn parse_page(body: &[u8]) -> Result<FeedPage, FetchError> {
    let feed = feed_rs::parser::parse(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    let raw_count = feed.entries.len();
    let mut items = Vec::with_capacity(raw_count);

    for entry in feed.entries {
        if entry.id.contains(ERROR_ENTRY_MARKER) {
            let message = entry
                .summary
                .map(|s| collapse_whitespace(&s.content))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| entry.id.clone());
            return Err(FetchError::Upstream(message));
        }

        match entry_to_item(entry) {
            Some(item) => items.push(item),
            None => continue,
        }
    }

    Ok(FeedPage { items, raw_count })
}

fn entry_to_item(entry: Entry) -> Option<FeedItem> {
    let id = paper_id(&entry.id);
    let published_at = match entry.published.or(entry.updated) {
        Some(at) => at,
        None => {
            warn!("Skipping entry {} without a publication date", entry.id);
            return None;
        }
    };

    let title = entry
        .title
        .map(|t| collapse_whitespace(&t.content))
        .unwrap_or_default();
    if title.is_empty() {
        warn!("Skipping entry {} without a title", entry.id);
        return None;
    }

    let pdf_url = entry
        .links
        .iter()
        .find(|l| l.media_type.as_deref() == Some("application/pdf"))
        .map(|l| l.href.clone())
        .unwrap_or_else(|| format!("https://arxiv.org/pdf/{}", id));

    Some(FeedItem {
        title,
        abstract_text: entry
            .summary
            .map(|s| collapse_whitespace(&s.content))
            .unwrap_or_default(),
        authors: entry
            .authors
            .iter()
            .map(|a| collapse_whitespace(&a.name))
            .filter(|a| !a.is_empty())
            .collect(),
        categories: entry.categories.iter().map(|c| c.term.clone()).collect(),
        published_at,
        pdf_url,
        id,
    })
}

/// Stable id from an entry URL: `http://arxiv.org/abs/2401.01234v2` → `2401.01234`.
pub fn paper_id(raw: &str) -> String {
    let tail = match raw.find("/abs/") {
        Some(pos) => &raw[pos + 5..],
        None => raw,
    };
    strip_version(tail.trim()).to_string()
}

fn strip_version(id: &str) -> &str {
    if let Some(pos) = id.rfind('v') {
        let suffix = &id[pos + 1..];
        if pos > 0 && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            return &id[..pos];
        }
    }
    id
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <id>http://arxiv.org/api/query-id</id>
  <title type="html">ArXiv Query</title>
  <updated>2024-06-03T00:00:00Z</updated>
  <entry>
    <id>http://arxiv.org/abs/2406.01234v2</id>
    <updated>2024-06-02T10:00:00Z</updated>
    <published>2024-06-01T12:30:00Z</published>
    <title>Machine   Learning
      for Alloy Design</title>
    <summary>  We study high-entropy
      alloys.
    </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/2406.01234v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2406.01234v2" rel="related" type="application/pdf"/>
    <category term="cond-mat.mtrl-sci" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/hep-th/9901001v1</id>
    <updated>1999-01-01T00:00:00Z</updated>
    <published>1999-01-01T00:00:00Z</published>
    <title>Strings</title>
    <summary>Old paper.</summary>
    <author><name>Someone</name></author>
    <category term="hep-th" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

    const ERROR_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <id>http://arxiv.org/api/error-id</id>
  <title type="html">ArXiv Query</title>
  <updated>2024-06-03T00:00:00Z</updated>
  <entry>
    <id>http://arxiv.org/api/errors#incorrect_id_format_for_1234</id>
    <title>Error</title>
    <summary>incorrect id format for 1234</summary>
    <updated>2024-06-03T00:00:00Z</updated>
    <author><name>arXiv api core</name></author>
  </entry>
</feed>"#;

    #[test]
    fn test_paper_id_strips_version() {
        assert_eq!(paper_id("http://arxiv.org/abs/2401.01234v3"), "2401.01234");
        assert_eq!(paper_id("http://arxiv.org/abs/hep-th/9901001v1"), "hep-th/9901001");
        assert_eq!(paper_id("http://arxiv.org/abs/solv-int/9901001"), "solv-int/9901001");
        assert_eq!(paper_id("2401.01234"), "2401.01234");
    }

    #[test]
    fn test_parse_page() {
        let page = parse_page(SAMPLE_FEED.as_bytes()).unwrap();
        assert_eq!(page.raw_count, 2);
        assert_eq!(page.items.len(), 2);

        let first = &page.items[0];
        assert_eq!(first.id, "2406.01234");
        assert_eq!(first.title, "Machine Learning for Alloy Design");
        assert_eq!(first.abstract_text, "We study high-entropy alloys.");
        assert_eq!(first.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(first.categories, vec!["cond-mat.mtrl-sci", "cs.LG"]);
        assert_eq!(first.pdf_url, "http://arxiv.org/pdf/2406.01234v2");
        assert_eq!(
            first.published_at,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap()
        );

        let second = &page.items[1];
        assert_eq!(second.id, "hep-th/9901001");
        assert_eq!(second.pdf_url, "https://arxiv.org/pdf/hep-th/9901001");
    }

    #[test]
    fn test_error_entry_is_upstream_error() {
        let err = parse_page(ERROR_FEED.as_bytes()).unwrap_err();
        assert!(matches!(err, FetchError::Upstream(ref m) if m.contains("incorrect id format")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = parse_page(b"<html>503 Service Unavailable</html>").unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }
}
