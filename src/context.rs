//! Process-wide application state with explicit startup and shutdown.

use crate::analysis::{AnalysisEngine, ChatClient, LlmBackend};
use crate::config::Config;
use crate::error::{ConfigError, PipelineError, StoreError};
use crate::feed::query::{build_query, Logic};
use crate::feed::{ArxivClient, FeedClient};
use crate::ingest::IngestionEngine;
use crate::store::{KeywordStore, ShardRegistry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One async mutex per keyword; held for the whole of a cycle.
#[derive(Default)]
pub struct KeywordLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeywordLocks {
    pub fn get(&self, keyword: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(keyword.to_string()).or_default())
    }

    pub fn is_held(&self, keyword: &str) -> bool {
        let lock = self.get(keyword);
        // Bound first so the temporary guard drops before `lock` does.
        let held = lock.try_lock().is_err();
        held
    }
}

pub struct AppContext {
    pub config: Config,
    pub keywords: Arc<KeywordStore>,
    pub shards: ShardRegistry,
    pub ingestion: IngestionEngine,
    analysis: Result<AnalysisEngine, ConfigError>,
    pub locks: KeywordLocks,
    pub cancel: CancellationToken,
}

impl AppContext {
    /// Open the stores under `general.data_dir` and build the real clients.
    ///
    /// A missing LLM credential does not prevent startup; it fails the first
    /// operation that needs the backend, before any network call.
    pub fn init(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;

        let data_dir = config.general.data_dir.clone();
        let keywords = KeywordStore::open(&data_dir.join("keywords.db"))?;
        let shards = ShardRegistry::on_disk(&data_dir);

        let feed = ArxivClient::new(&config.feed).map_err(|e| ConfigError::Invalid {
            field: "feed",
            reason: e.to_string(),
        })?;
        let llm = ChatClient::new(&config.llm).map(|c| Arc::new(c) as Arc<dyn LlmBackend>);

        Self::assemble(config, keywords, shards, Arc::new(feed), llm)
    }

    /// Build a context from explicit parts.
    pub fn assemble(
        config: Config,
        keywords: KeywordStore,
        shards: ShardRegistry,
        feed: Arc<dyn FeedClient>,
        llm: Result<Arc<dyn LlmBackend>, ConfigError>,
    ) -> Result<Self, PipelineError> {
        let keywords = Arc::new(keywords);
        let ingestion = IngestionEngine::new(feed, keywords.clone(), &config.feed);
        let analysis = llm.map(|backend| AnalysisEngine::new(backend, &config.llm));
        if let Err(ref e) = analysis {
            warn!("Analysis disabled until configured: {}", e);
        }

        let context = Self {
            config,
            keywords,
            shards,
            ingestion,
            analysis,
            locks: KeywordLocks::default(),
            cancel: CancellationToken::new(),
        };
        context.seed_keywords()?;
        context.log_watermarks()?;
        Ok(context)
    }

    pub fn analysis(&self) -> Result<&AnalysisEngine, ConfigError> {
        self.analysis.as_ref().map_err(|e| e.clone())
    }

    /// Create the configured seed keywords when the store is empty.
    fn seed_keywords(&self) -> Result<(), PipelineError> {
        if !self.keywords.is_empty()? {
            return Ok(());
        }

        let now = Utc::now();
        for name in &self.config.general.seed_keywords {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let query = build_query(name, &[name.to_string()], Logic::And, &[])?;
            match self.keywords.add(name, &query, now) {
                Ok(_) => info!("Seeded keyword {:?}", name),
                Err(StoreError::Conflict(_)) => debug!("Seed keyword {:?} listed twice", name),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn log_watermarks(&self) -> Result<(), PipelineError> {
        for keyword in self.keywords.list()? {
            match keyword.last_fetch_at {
                Some(at) => info!(
                    "Keyword {:?}{}: fetched through {}",
                    keyword.name,
                    if keyword.active { "" } else { " (inactive)" },
                    at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                None => info!("Keyword {:?}: never fetched", keyword.name),
            }
        }
        Ok(())
    }

    /// Cancel in-flight work and flush every open shard.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(e) = self.shards.checkpoint_all() {
            warn!("Failed to checkpoint shards on shutdown: {}", e);
        }
        info!("Shut down");
    }
}
