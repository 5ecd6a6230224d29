//! Markdown and JSON digests of a keyword's recent papers.
//!
//! A digest combines the papers ingested in a trailing window, their cached
//! summaries, the latest insight snapshot for that window and the locally
//! computed frequent terms.

use crate::analysis::TermCount;
use crate::models::{InsightSnapshot, Paper};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output format of an exported digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExportFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub keyword: String,
    pub window_days: u32,
    pub generated_at: DateTime<Utc>,
    /// Newest publication first.
    pub papers: Vec<Paper>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insight: Option<InsightSnapshot>,
    pub top_terms: Vec<TermCount>,
}

/// Render a digest in the requested format.
pub fn render(digest: &Digest, format: ExportFormat) -> Result<String, serde_json::Error> {
    match format {
        ExportFormat::Markdown => Ok(generate_markdown_digest(digest)),
        ExportFormat::Json => generate_json_digest(digest),
    }
}

/// Generate a complete Markdown digest.
pub fn generate_markdown_digest(digest: &Digest) -> String {
    let mut output = String::new();

    output.push_str(&format!("# Paperwatch Digest: {}\n\n", digest.keyword));
    output.push_str(&generate_metadata_section(digest));
    output.push_str(&generate_insight_section(digest.insight.as_ref()));
    output.push_str(&generate_terms_section(&digest.top_terms));
    output.push_str(&generate_papers_section(&digest.papers));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(digest: &Digest) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Keyword:** {}\n", digest.keyword));
    section.push_str(&format!("- **Window:** last {} day(s)\n", digest.window_days));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        digest.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Papers:** {}\n", digest.papers.len()));

    let summarized = digest.papers.iter().filter(|p| p.summary.is_some()).count();
    if summarized < digest.papers.len() {
        section.push_str(&format!(
            "- **Awaiting Analysis:** {}\n",
            digest.papers.len() - summarized
        ));
    }
    section.push('\n');

    section
}

fn generate_insight_section(insight: Option<&InsightSnapshot>) -> String {
    let Some(insight) = insight else {
        return String::new();
    };
    if insight.overview.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Insights\n\n");
    section.push_str(&insight.overview);
    section.push_str("\n\n");

    if !insight.trends.is_empty() {
        section.push_str("### Trends\n\n");
        for trend in &insight.trends {
            section.push_str(&format!("- {}\n", trend));
        }
        section.push('\n');
    }

    if !insight.highlights.is_empty() {
        section.push_str("### Highlights\n\n");
        for highlight in &insight.highlights {
            section.push_str(&format!("- {}\n", highlight));
        }
        section.push('\n');
    }

    section.push_str(&format!(
        "*Based on {} paper(s), generated {} by `{}`*\n\n",
        insight.paper_count,
        insight.generated_at.format("%Y-%m-%d %H:%M UTC"),
        insight.model
    ));

    section
}

fn generate_terms_section(terms: &[TermCount]) -> String {
    if terms.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Frequent Terms\n\n");
    section.push_str("| Term | Count |\n");
    section.push_str("|:---|:---:|\n");
    for term in terms {
        section.push_str(&format!("| {} | {} |\n", term.term, term.count));
    }
    section.push('\n');

    section
}

fn generate_papers_section(papers: &[Paper]) -> String {
    let mut section = String::new();

    section.push_str("## Papers\n\n");

    if papers.is_empty() {
        section.push_str("No papers were ingested in this window.\n\n");
        return section;
    }

    for paper in papers {
        section.push_str(&generate_paper_block(paper));
    }

    section
}

fn generate_paper_block(paper: &Paper) -> String {
    let mut block = String::new();

    block.push_str(&format!("### {}\n\n", paper.title));
    block.push_str(&format!(
        "*{} | {} | [PDF]({})*\n\n",
        paper.id,
        paper.published_at.format("%Y-%m-%d"),
        paper.pdf_url
    ));

    if !paper.authors.is_empty() {
        block.push_str(&format!("**Authors:** {}\n\n", paper.authors.join(", ")));
    }
    if !paper.categories.is_empty() {
        block.push_str(&format!("**Categories:** {}\n\n", paper.categories.join(", ")));
    }

    match paper.summary {
        Some(ref summary) => block.push_str(&format!("**Summary:** {}\n\n", summary)),
        None => {
            block.push_str("<details>\n<summary>Abstract</summary>\n\n");
            block.push_str(&paper.abstract_text);
            block.push_str("\n</details>\n\n");
        }
    }

    if !paper.insight_tags.is_empty() {
        block.push_str(&format!("**Tags:** {}\n\n", paper.insight_tags.join(", ")));
    }

    block.push_str("---\n\n");

    block
}

fn generate_footer() -> String {
    "*Digest generated by paperwatch*\n".to_string()
}

/// Generate a JSON digest.
pub fn generate_json_digest(digest: &Digest) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{now_micros, sample_paper};

    fn create_test_digest() -> Digest {
        let mut summarized = sample_paper("2406.00001", "High-entropy alloys");
        summarized.summary = Some("Alloys get stronger.".to_string());
        summarized.insight_tags = vec!["alloys".to_string()];
        let pending = sample_paper("2406.00002", "Ceramic coatings");

        Digest {
            keyword: "materials science".to_string(),
            window_days: 7,
            generated_at: now_micros(),
            papers: vec![summarized, pending],
            insight: Some(InsightSnapshot {
                keyword: "materials science".to_string(),
                window_days: 7,
                paper_set_hash: "abc".to_string(),
                paper_count: 2,
                overview: "Steady activity.".to_string(),
                trends: vec!["machine learning".to_string()],
                highlights: vec![],
                top_terms: vec!["alloys".to_string()],
                model: "test-model".to_string(),
                generated_at: now_micros(),
            }),
            top_terms: vec![TermCount {
                term: "alloys".to_string(),
                count: 2,
            }],
        }
    }

    #[test]
    fn test_generate_markdown_digest() {
        let digest = create_test_digest();
        let markdown = generate_markdown_digest(&digest);

        assert!(markdown.contains("# Paperwatch Digest: materials science"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("- **Awaiting Analysis:** 1"));
        assert!(markdown.contains("## Insights"));
        assert!(markdown.contains("### Trends"));
        assert!(!markdown.contains("### Highlights"));
        assert!(markdown.contains("| alloys | 2 |"));
        assert!(markdown.contains("**Summary:** Alloys get stronger."));
        assert!(markdown.contains("<summary>Abstract</summary>"));
    }

    #[test]
    fn test_empty_digest() {
        let mut digest = create_test_digest();
        digest.papers.clear();
        digest.insight = None;
        digest.top_terms.clear();

        let markdown = generate_markdown_digest(&digest);
        assert!(markdown.contains("No papers were ingested in this window."));
        assert!(!markdown.contains("## Insights"));
        assert!(!markdown.contains("## Frequent Terms"));
    }

    #[test]
    fn test_generate_json_digest() {
        let digest = create_test_digest();
        let json = render(&digest, ExportFormat::Json).unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["keyword"], "materials science");
        assert_eq!(value["papers"].as_array().unwrap().len(), 2);
        assert_eq!(value["papers"][0]["abstract"], digest.papers[0].abstract_text);
        assert_eq!(value["insight"]["overview"], "Steady activity.");
    }
}
