//! Upstream paper feed.
//!
//! A [`FeedClient`] fetches one page of candidates for a query and window.
//! It does no dedup and no watermark bookkeeping; that belongs to ingestion.

pub mod arxiv;
pub mod query;

pub use arxiv::ArxivClient;

use crate::error::FetchError;
use crate::models::{FeedItem, FetchWindow};
use async_trait::async_trait;

/// One page request against the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// Keyword search expression, without the date restriction.
    pub query: String,
    pub window: FetchWindow,
    /// Offset of the first result.
    pub start: usize,
    pub max_results: usize,
}

/// A parsed page of results.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    /// Entries the upstream returned, including ones that could not be used.
    /// A short page (`raw_count < max_results`) means the result set is exhausted.
    pub raw_count: usize,
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError>;
}
