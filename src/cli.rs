//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::feed::query::Logic;
use crate::report::ExportFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Paperwatch - scheduled arXiv monitoring with LLM summaries
///
/// Tracks keywords on arXiv, stores new papers per keyword, summarizes them
/// with an OpenAI-compatible LLM and keeps trend insights up to date.
///
/// Examples:
///   paperwatch init-config
///   paperwatch keywords add "perovskite" --term "perovskite solar" --term stability
///   paperwatch run --keyword "materials science"
///   paperwatch daemon
///   paperwatch export "materials science" --days 7 --format json -o digest.json
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .paperwatch.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding the keyword store and shards
    #[arg(long, value_name = "DIR", env = "PAPERWATCH_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// LLM model used for analysis
    #[arg(long, env = "PAPERWATCH_MODEL", global = true)]
    pub model: Option<String>,

    /// Base URL of the OpenAI-compatible LLM API
    #[arg(long, value_name = "URL", env = "PAPERWATCH_LLM_URL", global = true)]
    pub llm_url: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate a default .paperwatch.toml configuration file
    InitConfig,

    /// Run one ingest and analysis cycle now
    Run {
        /// Only run this keyword (default: every active keyword)
        #[arg(short, long)]
        keyword: Option<String>,
    },

    /// Run cycles at the configured daily time until interrupted
    Daemon,

    /// Show scheduler state and per-keyword health
    Status,

    /// Search stored papers by title, abstract or summary
    Search {
        query: String,
    },

    /// List papers ingested recently for a keyword
    Recent {
        keyword: String,

        #[arg(short, long, default_value = "7")]
        days: u32,
    },

    /// Show the trend insight for a keyword, regenerating it when stale
    Insights {
        keyword: String,

        #[arg(short, long, default_value = "7")]
        days: u32,
    },

    /// Show archived daily insight snapshots for a keyword
    History {
        keyword: String,

        /// Insight window the snapshots were generated for
        #[arg(short, long, default_value = "7")]
        days: u32,

        /// Number of days to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Compare two stored papers by id
    Compare {
        id_a: String,
        id_b: String,
    },

    /// Most frequent terms in a keyword's recent papers
    Trending {
        keyword: String,

        #[arg(short, long, default_value = "7")]
        days: u32,

        /// Number of terms to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Export a digest of a keyword's recent papers
    Export {
        keyword: String,

        #[arg(short, long, default_value = "7")]
        days: u32,

        /// Output format (markdown, json)
        #[arg(long, default_value = "markdown", value_name = "FORMAT")]
        format: ExportFormat,

        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Manage tracked keywords
    #[command(subcommand)]
    Keywords(KeywordCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum KeywordCommand {
    /// List keywords with their watermarks
    List,

    /// Track a new keyword
    Add {
        name: String,

        /// Search term; repeat for several (default: the name itself)
        #[arg(short, long = "term", value_name = "TERM")]
        terms: Vec<String>,

        /// How terms are combined
        #[arg(long, default_value = "and")]
        logic: Logic,

        /// Restrict to an arXiv category, e.g. cond-mat.mtrl-sci; repeatable
        #[arg(long = "category", value_name = "CAT")]
        categories: Vec<String>,
    },

    /// Stop tracking a keyword (its shard file is kept)
    Remove {
        name: String,
    },

    /// Include a keyword in scheduled runs
    Enable {
        name: String,
    },

    /// Exclude a keyword from scheduled runs
    Disable {
        name: String,
    },
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref url) = self.llm_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("LLM URL must start with 'http://' or 'https://'".to_string());
            }
        }

        match self.command {
            Command::Recent { days, .. }
            | Command::Insights { days, .. }
            | Command::Export { days, .. }
                if days == 0 =>
            {
                Err("Days must be at least 1".to_string())
            }
            Command::Trending { days, limit, .. } | Command::History { days, limit, .. }
                if days == 0 || limit == 0 =>
            {
                Err("Days and limit must be at least 1".to_string())
            }
            Command::Compare {
                ref id_a, ref id_b, ..
            } if id_a.trim() == id_b.trim() => {
                Err("Cannot compare a paper with itself".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self, verbose_by_default: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || verbose_by_default {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_run_with_globals() {
        let args = parse(&[
            "paperwatch",
            "run",
            "--keyword",
            "materials science",
            "--data-dir",
            "/tmp/pw",
            "-v",
        ]);
        assert!(matches!(
            args.command,
            Command::Run { keyword: Some(ref k) } if k == "materials science"
        ));
        assert_eq!(args.data_dir, Some(PathBuf::from("/tmp/pw")));
        assert!(args.verbose);
    }

    #[test]
    fn test_parse_keyword_add() {
        let args = parse(&[
            "paperwatch",
            "keywords",
            "add",
            "perovskite",
            "--term",
            "perovskite solar",
            "-t",
            "stability",
            "--logic",
            "or",
            "--category",
            "cond-mat.mtrl-sci",
        ]);
        match args.command {
            Command::Keywords(KeywordCommand::Add {
                name,
                terms,
                logic,
                categories,
            }) => {
                assert_eq!(name, "perovskite");
                assert_eq!(terms, vec!["perovskite solar", "stability"]);
                assert_eq!(logic, Logic::Or);
                assert_eq!(categories, vec!["cond-mat.mtrl-sci"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_export_defaults() {
        let args = parse(&["paperwatch", "export", "ml"]);
        match args.command {
            Command::Export {
                days,
                format,
                output,
                ..
            } => {
                assert_eq!(days, 7);
                assert_eq!(format, ExportFormat::Markdown);
                assert!(output.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = parse(&["paperwatch", "status"]);
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_days_and_self_compare() {
        assert!(parse(&["paperwatch", "recent", "ml", "--days", "0"])
            .validate()
            .is_err());
        assert!(parse(&["paperwatch", "trending", "ml", "--limit", "0"])
            .validate()
            .is_err());
        assert!(parse(&["paperwatch", "history", "ml", "--limit", "0"])
            .validate()
            .is_err());
        assert!(parse(&["paperwatch", "history", "ml", "-d", "30"])
            .validate()
            .is_ok());
        assert!(parse(&["paperwatch", "compare", "2406.1", "2406.1"])
            .validate()
            .is_err());
        assert!(parse(&["paperwatch", "compare", "2406.1", "2406.2"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_log_level() {
        let mut args = parse(&["paperwatch", "status"]);
        assert_eq!(args.log_level(false), tracing::Level::INFO);
        assert_eq!(args.log_level(true), tracing::Level::DEBUG);

        args.verbose = true;
        assert_eq!(args.log_level(false), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(true), tracing::Level::ERROR);
    }
}
