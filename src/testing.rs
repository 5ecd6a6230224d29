//! Fakes and fixtures shared by unit tests.

use crate::analysis::llm::{ChatRequest, LlmBackend};
use crate::analysis::prompts::{
    COMPARISON_SYSTEM_PROMPT, INSIGHT_SYSTEM_PROMPT, SUMMARY_SYSTEM_PROMPT,
};
use crate::error::{AnalysisError, FetchError};
use crate::feed::{FeedClient, FeedPage, PageRequest};
use crate::models::{FeedItem, Paper};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Current time truncated to the microsecond precision the stores keep.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

pub fn feed_item(id: &str, title: &str, published_at: DateTime<Utc>) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        title: title.to_string(),
        abstract_text: format!("We report progress on {}.", title.to_lowercase()),
        authors: vec!["Ada Lovelace".to_string(), "Alan Turing".to_string()],
        categories: vec!["cond-mat.mtrl-sci".to_string()],
        published_at,
        pdf_url: format!("https://arxiv.org/pdf/{}", id),
    }
}

/// A paper published two hours ago and ingested an hour ago.
pub fn sample_paper(id: &str, title: &str) -> Paper {
    let now = now_micros();
    feed_item(id, title, now - Duration::hours(2)).into_paper(now - Duration::hours(1))
}

/// In-memory feed that pages through a fixed item list in ascending order.
pub struct FakeFeed {
    items: Mutex<Vec<FeedItem>>,
    respect_window: bool,
    /// Page index → remaining failures.
    failures: Mutex<HashMap<usize, u32>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl FakeFeed {
    /// A feed that applies the requested window like the real API.
    pub fn new(items: Vec<FeedItem>) -> Self {
        Self::build(items, true)
    }

    /// A feed that returns every item regardless of the window.
    pub fn ignoring_window(items: Vec<FeedItem>) -> Self {
        Self::build(items, false)
    }

    fn build(items: Vec<FeedItem>, respect_window: bool) -> Self {
        Self {
            items: Mutex::new(items),
            respect_window,
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: FeedItem) {
        self.items.lock().unwrap().push(item);
    }

    /// Make the page at `index` fail `times` times with a transient error.
    pub fn fail_page(&self, index: usize, times: u32) {
        self.failures.lock().unwrap().insert(index, times);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedClient for FakeFeed {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
        self.requests.lock().unwrap().push(request.clone());

        let index = request.start / request.max_results.max(1);
        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Timeout(1));
            }
        }

        let mut items: Vec<FeedItem> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|item| !self.respect_window || request.window.contains(item.published_at))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.published_at.cmp(&b.published_at).then(a.id.cmp(&b.id)));

        let page: Vec<FeedItem> = items
            .into_iter()
            .skip(request.start)
            .take(request.max_results)
            .collect();
        Ok(FeedPage {
            raw_count: page.len(),
            items: page,
        })
    }
}

/// Backend that answers by system prompt and counts every call.
pub struct FakeLlm {
    calls: AtomicUsize,
    /// User-prompt substrings that get a non-JSON reply.
    garbled: Mutex<Vec<String>>,
    /// User-prompt substrings that time out.
    unreachable: Mutex<Vec<String>>,
    /// Cancelled once this many calls have been answered.
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            garbled: Mutex::new(Vec::new()),
            unreachable: Mutex::new(Vec::new()),
            cancel_after: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn garble(&self, marker: &str) {
        self.garbled.lock().unwrap().push(marker.to_string());
    }

    pub fn time_out_on(&self, marker: &str) {
        self.unreachable.lock().unwrap().push(marker.to_string());
    }

    pub fn cancel_after(&self, calls: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((calls, token));
    }
}

#[async_trait]
impl LlmBackend for FakeLlm {
    fn model(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, AnalysisError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, ref token)) = *self.cancel_after.lock().unwrap() {
            if call == after {
                token.cancel();
            }
        }
        let system = request.content_of("system").unwrap_or_default();
        let user = request.content_of("user").unwrap_or_default();

        if self.unreachable.lock().unwrap().iter().any(|m| user.contains(m.as_str())) {
            return Err(AnalysisError::Timeout(1));
        }
        if self.garbled.lock().unwrap().iter().any(|m| user.contains(m.as_str())) {
            return Ok("I'm sorry, I can't produce JSON today.".to_string());
        }

        let reply = if system == SUMMARY_SYSTEM_PROMPT {
            r#"```json
{"summary": "A concise summary.", "key_points": ["First point"], "tags": ["Materials", "materials", "ML"]}
```"#
        } else if system == COMPARISON_SYSTEM_PROMPT {
            r#"{"comparison": "Both study materials.", "similarities": ["domain"], "differences": ["method"]}"#
        } else if system == INSIGHT_SYSTEM_PROMPT {
            r#"{"overview": "Steady activity.", "trends": ["machine learning"], "highlights": ["alloys"]}"#
        } else {
            return Err(AnalysisError::Http {
                status: 400,
                body: "unknown prompt".to_string(),
            });
        };
        Ok(reply.to_string())
    }
}
