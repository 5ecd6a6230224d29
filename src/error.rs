//! Error taxonomy for the ingestion and analysis pipeline.
//!
//! Only [`FetchError`] and [`AnalysisError`] are recovered locally (retry with
//! backoff). [`StoreError`] and [`ConfigError`] propagate to the scheduler,
//! which records them against the keyword and leaves its watermark untouched.

use thiserror::Error;

/// Transient or parse failure talking to the upstream paper feed.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("feed request timed out after {0}s")]
    Timeout(u64),

    #[error("feed transport error: {0}")]
    Transport(String),

    #[error("feed returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to parse feed response: {0}")]
    Parse(String),

    #[error("feed reported an error: {0}")]
    Upstream(String),
}

impl FetchError {
    /// Whether another attempt at the same page can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Transport(_) | FetchError::Parse(_) => true,
            FetchError::Http { status, .. } => *status == 429 || *status >= 500,
            FetchError::Upstream(_) => false,
        }
    }
}

/// Failure producing a validated analysis artifact.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM rate limit or quota exceeded: {0}")]
    RateLimited(String),

    #[error("LLM API error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("LLM rejected credentials: {0}")]
    Auth(String),

    #[error("malformed LLM response: {0}")]
    Malformed(String),

    #[error("LLM response failed validation: {0}")]
    Invalid(String),

    #[error("analysis unavailable after {attempts} attempt(s): {last}")]
    Unavailable {
        attempts: u32,
        last: Box<AnalysisError>,
    },
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalysisError::Timeout(_)
            | AnalysisError::Transport(_)
            | AnalysisError::RateLimited(_)
            | AnalysisError::Malformed(_)
            | AnalysisError::Invalid(_) => true,
            AnalysisError::Http { status, .. } => *status >= 500,
            AnalysisError::Auth(_) | AnalysisError::Unavailable { .. } => false,
        }
    }
}

/// Failure reading or writing a durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode stored JSON: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[error("store lock poisoned")]
    Poisoned,

    #[error("{0} already exists")]
    Conflict(String),

    #[error("{0} not found in store")]
    Missing(String),
}

/// Invalid or incomplete configuration, detected before any network call.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("missing credential: set `llm.api_key` or the {0} environment variable")]
    MissingCredential(String),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid keyword {name:?}: {reason}")]
    InvalidKeyword { name: String, reason: String },
}

/// Outcome of a pipeline entry point.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("a cycle for keyword {0:?} is already in flight")]
    Busy(String),

    #[error("unknown keyword {0:?}")]
    UnknownKeyword(String),

    #[error("paper {0} not found in any shard")]
    PaperNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cycle cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Fatal errors abort the current keyword cycle; the rest are per-item.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Analysis(_))
    }
}
