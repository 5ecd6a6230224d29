//! LLM-backed analysis of stored papers.

pub mod engine;
pub mod llm;
pub mod prompts;
pub mod response;
pub mod trending;

pub use engine::AnalysisEngine;
pub use llm::{ChatClient, LlmBackend};
pub use trending::{top_terms, TermCount};
