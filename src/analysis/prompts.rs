//! Prompt templates. Builders are pure so identical inputs give identical prompts.

use crate::models::{truncate_chars, Paper};

/// Bumped whenever a prompt or response shape changes; part of every cache key.
pub const PROMPT_SCHEMA_VERSION: &str = "paper-analysis-v1";

/// Longest abstract excerpt placed in comparison and insight prompts.
const EXCERPT_CHARS: usize = 500;

pub const SUMMARY_SYSTEM_PROMPT: &str = r#"You are an expert research analyst who extracts the core contribution, method and conclusion of academic papers.
Respond with a single JSON object and nothing else:
{"summary": "<150-250 word summary>", "key_points": ["<point>", ...], "tags": ["<topic tag>", ...]}
Use at most 8 key points and at most 8 short lowercase tags."#;

pub const COMPARISON_SYSTEM_PROMPT: &str = r#"You are an expert research analyst who compares academic papers in depth.
Respond with a single JSON object and nothing else:
{"comparison": "<structured comparison>", "similarities": ["<item>", ...], "differences": ["<item>", ...]}
Cover research goals, methodology, contributions, strengths and weaknesses, and where each applies.
Use at most 10 similarities and at most 10 differences."#;

pub const INSIGHT_SYSTEM_PROMPT: &str = r#"You are a research trend analyst who finds valuable insights in recent academic papers.
Respond with a single JSON object and nothing else:
{"overview": "<under 400 words>", "trends": ["<trend>", ...], "highlights": ["<notable paper or breakthrough>", ...]}
Use at most 10 trends and at most 10 highlights."#;

pub fn summary_prompt(paper: &Paper) -> String {
    format!(
        "Summarize the following paper, highlighting its main contribution, method and conclusion.\n\n\
         Title: {}\n\n\
         Authors: {}\n\n\
         Categories: {}\n\n\
         Abstract: {}\n",
        paper.title,
        paper.authors.join(", "),
        paper.categories.join(", "),
        paper.abstract_text
    )
}

fn paper_block(label: &str, paper: &Paper) -> String {
    format!(
        "### {} [{}]\nTitle: {}\nCategories: {}\nSummary: {}\n",
        label,
        paper.id,
        paper.title,
        paper.categories.join(", "),
        paper.digest_text(EXCERPT_CHARS)
    )
}

/// Callers pass the pair already sorted by id.
pub fn comparison_prompt(first: &Paper, second: &Paper) -> String {
    format!(
        "Compare the similarities and differences of these two papers.\n\n{}\n{}",
        paper_block("Paper A", first),
        paper_block("Paper B", second)
    )
}

pub fn insight_prompt(
    keyword: &str,
    window_days: u32,
    papers: &[Paper],
    top_terms: &[String],
) -> String {
    let mut prompt = format!(
        "Based on the following {} paper(s) about \"{}\" from the last {} day(s), \
         analyse the current research trends and notable findings.\n\n",
        papers.len(),
        keyword,
        window_days
    );

    if !top_terms.is_empty() {
        prompt.push_str(&format!("Frequent terms: {}\n\n", top_terms.join(", ")));
    }

    for (i, paper) in papers.iter().enumerate() {
        prompt.push_str(&paper_block(&format!("Paper {}", i + 1), paper));
        prompt.push('\n');
    }

    prompt.push_str(
        "Cover the main trends and hot topics, important breakthroughs, and promising directions.",
    );
    prompt
}

/// Short excerpt for logs.
pub fn excerpt(text: &str) -> String {
    truncate_chars(text, 80)
}
