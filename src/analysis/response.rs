//! Strict parsing of LLM responses.
//!
//! A response must be a single JSON object of the expected shape, optionally
//! wrapped in a markdown code fence. Anything else is an error and is retried.

use crate::error::AnalysisError;
use serde::de::DeserializeOwned;
use serde::Deserialize;

pub const MAX_TAGS: usize = 8;
pub const MAX_KEY_POINTS: usize = 8;
pub const MAX_LIST_ITEMS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryFields {
    pub text: String,
    pub key_points: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonFields {
    pub comparison: String,
    pub similarities: Vec<String>,
    pub differences: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsightFields {
    pub overview: String,
    pub trends: Vec<String>,
    pub highlights: Vec<String>,
}

#[derive(Deserialize)]
struct RawSummary {
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct RawComparison {
    comparison: String,
    #[serde(default)]
    similarities: Vec<String>,
    #[serde(default)]
    differences: Vec<String>,
}

#[derive(Deserialize)]
struct RawInsight {
    overview: String,
    #[serde(default)]
    trends: Vec<String>,
    #[serde(default)]
    highlights: Vec<String>,
}

/// Strip markdown code blocks from a response.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, AnalysisError> {
    let body = strip_code_blocks(raw);
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| AnalysisError::Malformed(format!("not JSON: {}", e)))?;
    if !value.is_object() {
        return Err(AnalysisError::Malformed("expected a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| AnalysisError::Invalid(e.to_string()))
}

fn required_text(field: &str, text: String) -> Result<String, AnalysisError> {
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(AnalysisError::Invalid(format!("`{}` is empty", field)));
    }
    Ok(text)
}

fn bounded_list(field: &str, items: Vec<String>, max: usize) -> Result<Vec<String>, AnalysisError> {
    if items.len() > max {
        return Err(AnalysisError::Invalid(format!(
            "`{}` has {} entries, at most {} allowed",
            field,
            items.len(),
            max
        )));
    }
    items
        .into_iter()
        .map(|item| {
            let item = item.trim().to_string();
            if item.is_empty() {
                Err(AnalysisError::Invalid(format!("`{}` contains an empty entry", field)))
            } else {
                Ok(item)
            }
        })
        .collect()
}

/// Trimmed, lowercased and deduplicated in first-seen order.
fn normalize_tags(tags: Vec<String>) -> Result<Vec<String>, AnalysisError> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            return Err(AnalysisError::Invalid("`tags` contains an empty entry".to_string()));
        }
        if !normalized.contains(&tag) {
            normalized.push(tag);
        }
    }
    bounded_list("tags", normalized, MAX_TAGS)
}

pub fn parse_summary(raw: &str) -> Result<SummaryFields, AnalysisError> {
    let parsed: RawSummary = decode(raw)?;
    Ok(SummaryFields {
        text: required_text("summary", parsed.summary)?,
        key_points: bounded_list("key_points", parsed.key_points, MAX_KEY_POINTS)?,
        tags: normalize_tags(parsed.tags)?,
    })
}

pub fn parse_comparison(raw: &str) -> Result<ComparisonFields, AnalysisError> {
    let parsed: RawComparison = decode(raw)?;
    Ok(ComparisonFields {
        comparison: required_text("comparison", parsed.comparison)?,
        similarities: bounded_list("similarities", parsed.similarities, MAX_LIST_ITEMS)?,
        differences: bounded_list("differences", parsed.differences, MAX_LIST_ITEMS)?,
    })
}

pub fn parse_insight(raw: &str) -> Result<InsightFields, AnalysisError> {
    let parsed: RawInsight = decode(raw)?;
    Ok(InsightFields {
        overview: required_text("overview", parsed.overview)?,
        trends: bounded_list("trends", parsed.trends, MAX_LIST_ITEMS)?,
        highlights: bounded_list("highlights", parsed.highlights, MAX_LIST_ITEMS)?,
    })
}
