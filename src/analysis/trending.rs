//! Local term-frequency statistics over a set of papers.

use crate::models::Paper;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Words too common in abstracts to say anything about a topic.
const STOP_WORDS: &[&str] = &[
    "about", "across", "also", "among", "based", "been", "being", "between", "both", "by",
    "can", "could", "does", "each", "from", "have", "here", "however", "into", "more", "most",
    "only", "other", "over", "paper", "propose", "proposed", "results", "show", "such", "than",
    "that", "their", "them", "then", "there", "these", "they", "this", "those", "through",
    "under", "using", "very", "were", "what", "when", "where", "which", "while", "will",
    "with", "within", "without", "work", "would",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCount {
    pub term: String,
    pub count: usize,
}

fn is_candidate(word: &str) -> bool {
    word.chars().count() > 3
        && !word.chars().all(|c| c.is_ascii_digit())
        && !STOP_WORDS.contains(&word)
}

/// Count words in titles and abstracts.
pub fn term_frequencies(papers: &[Paper]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();

    for paper in papers {
        let text = format!("{} {}", paper.title, paper.abstract_text).to_lowercase();
        for word in text.split(|c: char| !c.is_alphanumeric() && c != '-') {
            let word = word.trim_matches('-');
            if is_candidate(word) {
                *counts.entry(word.to_string()).or_default() += 1;
            }
        }
    }

    counts
}

/// The `n` most frequent terms, ties broken alphabetically.
pub fn top_terms(papers: &[Paper], n: usize) -> Vec<TermCount> {
    let mut terms: Vec<TermCount> = term_frequencies(papers)
        .into_iter()
        .map(|(term, count)| TermCount { term, count })
        .collect();

    terms.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
    terms.truncate(n);
    terms
}
