//! Search expression generation for the arXiv query API.

use crate::error::ConfigError;
use crate::models::FetchWindow;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::fmt;

/// How multiple terms of a keyword are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Logic {
    /// Every term must match
    #[default]
    And,
    /// Any term may match
    Or,
}

impl fmt::Display for Logic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Logic::And => write!(f, "AND"),
            Logic::Or => write!(f, "OR"),
        }
    }
}

/// Collapse whitespace and replace characters that would break the query syntax.
pub fn clean_term(term: &str) -> String {
    let replaced: String = term
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '.' | '\'') {
                c
            } else {
                ' '
            }
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build the search expression for a keyword.
///
/// Multi-word terms are quoted as phrases. Categories, when given, are
/// OR-ed together and AND-ed with the terms.
pub fn build_query(
    name: &str,
    terms: &[String],
    logic: Logic,
    categories: &[String],
) -> Result<String, ConfigError> {
    let cleaned: Vec<String> = terms
        .iter()
        .map(|t| clean_term(t))
        .filter(|t| !t.is_empty())
        .collect();

    if cleaned.is_empty() {
        return Err(ConfigError::InvalidKeyword {
            name: name.to_string(),
            reason: "no usable search terms".to_string(),
        });
    }

    let term_parts: Vec<String> = cleaned
        .iter()
        .map(|term| {
            if term.contains(' ') {
                format!("all:\"{}\"", term)
            } else {
                format!("all:{}", term)
            }
        })
        .collect();
    let joined_terms = term_parts.join(&format!(" {} ", logic));

    let categories: Vec<String> = categories
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|c| format!("cat:{}", c))
        .collect();

    if categories.is_empty() {
        return Ok(joined_terms);
    }

    let category_part = if categories.len() > 1 {
        format!("({})", categories.join(" OR "))
    } else {
        categories[0].clone()
    };
    let term_part = if term_parts.len() > 1 {
        format!("({})", joined_terms)
    } else {
        joined_terms
    };

    Ok(format!("{} AND {}", category_part, term_part))
}

fn minute_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::minutes(1)).unwrap_or(at)
}

fn minute_ceil(at: DateTime<Utc>) -> DateTime<Utc> {
    let floor = minute_floor(at);
    if floor == at {
        at
    } else {
        floor + Duration::minutes(1)
    }
}

/// `submittedDate:[YYYYMMDDHHMM TO YYYYMMDDHHMM]` covering the window.
///
/// The API only has minute granularity, so the range is widened outwards;
/// exact bounds are enforced client-side with [`FetchWindow::contains`].
pub fn submitted_date_range(window: &FetchWindow) -> String {
    format!(
        "submittedDate:[{} TO {}]",
        minute_floor(window.start).format("%Y%m%d%H%M"),
        minute_ceil(window.end).format("%Y%m%d%H%M")
    )
}

/// Keyword expression restricted to the window.
pub fn windowed_query(query: &str, window: &FetchWindow) -> String {
    format!("({}) AND {}", query, submitted_date_range(window))
}
