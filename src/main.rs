//! Paperwatch - scheduled arXiv monitoring with LLM analysis
//!
//! A CLI tool that ingests new papers for tracked keywords, summarizes
//! them with an OpenAI-compatible LLM and maintains trend insights.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (configuration, store, network, etc.)
//!   2 - One or more keyword cycles failed

mod analysis;
mod cli;
mod config;
mod context;
mod error;
mod feed;
mod ingest;
mod models;
mod report;
mod retry;
mod scheduler;
mod service;
mod store;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use cli::{Args, Command, KeywordCommand};
use config::{Config, DEFAULT_CONFIG_FILE};
use context::AppContext;
use indicatif::{ProgressBar, ProgressStyle};
use models::{CycleReport, Paper};
use service::PaperService;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if matches!(args.command, Command::InitConfig) {
        return handle_init_config();
    }

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(&args, &config);

    info!("Paperwatch v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .paperwatch.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Set the LLM credential with DEEPSEEK_API_KEY or `llm.api_key`.");
    Ok(())
}

/// Initialize logging based on verbosity settings. `RUST_LOG` takes precedence.
fn init_logging(args: &Args, config: &Config) {
    let level = args.log_level(config.general.verbose);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        return Config::load(config_path);
    }

    Ok(Config::load_default()?.unwrap_or_default())
}

/// Open the stores, dispatch the command and shut down cleanly.
async fn run(args: Args, config: Config) -> Result<i32> {
    info!("Data directory: {}", config.general.data_dir.display());
    let ctx = Arc::new(AppContext::init(config).context("Failed to initialize paperwatch")?);
    let service = PaperService::new(Arc::clone(&ctx));

    let result = dispatch(&service, &args).await;
    ctx.shutdown();
    result
}

async fn dispatch(service: &PaperService, args: &Args) -> Result<i32> {
    match args.command {
        Command::InitConfig => handle_init_config().map(|_| 0),
        Command::Run { ref keyword } => handle_run(service, keyword.as_deref(), args.quiet).await,
        Command::Daemon => handle_daemon(service).await,
        Command::Status => handle_status(service),
        Command::Search { ref query } => {
            let hits = service.search(query)?;
            if hits.is_empty() {
                println!("No papers match {:?}.", query);
            }
            for hit in &hits {
                print_paper(&hit.paper);
                println!("     Keywords: {}", hit.keywords.join(", "));
            }
            Ok(0)
        }
        Command::Recent { ref keyword, days } => {
            let papers = service.recent(keyword, days)?;
            println!(
                "📚 {} paper(s) ingested for {:?} in the last {} day(s)\n",
                papers.len(),
                keyword,
                days
            );
            for paper in &papers {
                print_paper(paper);
            }
            Ok(0)
        }
        Command::Insights { ref keyword, days } => {
            let snapshot = service.get_insights(keyword, days).await?;
            println!(
                "🔭 Insights for {:?} (last {} day(s), {} paper(s))\n",
                snapshot.keyword, snapshot.window_days, snapshot.paper_count
            );
            if snapshot.paper_count == 0 {
                println!("   No papers in this window.");
                return Ok(0);
            }
            println!("{}\n", snapshot.overview);
            print_list("Trends", &snapshot.trends);
            print_list("Highlights", &snapshot.highlights);
            if !snapshot.top_terms.is_empty() {
                println!("Frequent terms: {}", snapshot.top_terms.join(", "));
            }
            Ok(0)
        }
        Command::History {
            ref keyword,
            days,
            limit,
        } => {
            let history = service.insight_history(keyword, days, limit)?;
            println!("🗂️  Insight history for {:?} ({}-day window)\n", keyword, days);
            if history.is_empty() {
                println!("   Nothing archived yet. Snapshots are kept after each cycle.");
            }
            for entry in &history {
                let snapshot = &entry.snapshot;
                println!(
                    "  {} | {} paper(s)",
                    entry.generated_on.format("%Y-%m-%d"),
                    snapshot.paper_count
                );
                if !snapshot.overview.is_empty() {
                    println!("     {}", snapshot.overview);
                }
                if !snapshot.trends.is_empty() {
                    println!("     Trends: {}", snapshot.trends.join(", "));
                }
                if !snapshot.top_terms.is_empty() {
                    println!("     Frequent terms: {}", snapshot.top_terms.join(", "));
                }
            }
            Ok(0)
        }
        Command::Compare { ref id_a, ref id_b } => {
            let result = service.compare(id_a, id_b).await?;
            println!("⚖️  {} vs {}\n", result.paper_a, result.paper_b);
            println!("{}\n", result.comparison);
            print_list("Similarities", &result.similarities);
            print_list("Differences", &result.differences);
            Ok(0)
        }
        Command::Trending {
            ref keyword,
            days,
            limit,
        } => {
            let terms = service.trending(keyword, days, limit)?;
            println!("📈 Trending terms for {:?} (last {} day(s))\n", keyword, days);
            for (i, term) in terms.iter().enumerate() {
                println!("   {:>2}. {} ({})", i + 1, term.term, term.count);
            }
            Ok(0)
        }
        Command::Export {
            ref keyword,
            days,
            format,
            ref output,
        } => {
            let content = service.export(keyword, days, format)?;
            match output {
                Some(path) => {
                    std::fs::write(path, &content)
                        .with_context(|| format!("Failed to write digest to {}", path.display()))?;
                    println!("✅ Digest saved to: {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(0)
        }
        Command::Keywords(ref command) => handle_keywords(service, command),
    }
}

/// Run one cycle with a spinner. Returns exit code (0 or 2).
async fn handle_run(service: &PaperService, keyword: Option<&str>, quiet: bool) -> Result<i32> {
    let spinner = if quiet {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .context("Invalid progress template")?,
        );
        pb.set_message(match keyword {
            Some(name) => format!("Running cycle for {:?}...", name),
            None => "Running cycle for all active keywords...".to_string(),
        });
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    };

    let reports = service.run_once(keyword).await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let reports = reports?;

    if reports.is_empty() {
        println!("Nothing to run.");
        return Ok(0);
    }
    for report in &reports {
        print_cycle(report);
    }

    Ok(if reports.iter().any(CycleReport::failed) {
        2
    } else {
        0
    })
}

/// Run the scheduler until Ctrl-C.
async fn handle_daemon(service: &PaperService) -> Result<i32> {
    let cancel = service.scheduler().context().cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing up");
            cancel.cancel();
        }
    });

    println!("⏰ Scheduler running. Press Ctrl-C to stop.");
    service.scheduler().run_forever().await?;
    Ok(0)
}

fn handle_status(service: &PaperService) -> Result<i32> {
    let status = service.get_status()?;

    println!("📊 Scheduler: {}", status.phase);
    if let Some(last) = status.last_run {
        println!("   Last run: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(next) = status.next_run {
        println!("   Next run: {}", next.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(ref failure) = status.last_failure {
        println!("   Last failure: {}", failure);
    }
    println!();

    for health in &status.keywords {
        println!(
            "{} {}{}",
            health.emoji(),
            health.keyword,
            if health.active { "" } else { " (inactive)" }
        );
        println!(
            "     Papers: {} | Awaiting analysis: {}",
            health.paper_count, health.pending_analysis
        );
        match health.watermark {
            Some(at) => println!("     Fetched through: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("     Never fetched"),
        }
        if let Some(at) = health.last_run_at {
            println!("     Last run: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(ref error) = health.last_error {
            println!("     Last error: {}", error);
        }
    }
    Ok(0)
}

fn handle_keywords(service: &PaperService, command: &KeywordCommand) -> Result<i32> {
    match command {
        KeywordCommand::List => {
            let keywords = service.list_keywords()?;
            if keywords.is_empty() {
                println!("No keywords tracked. Add one with `paperwatch keywords add <name>`.");
            }
            for keyword in &keywords {
                println!(
                    "{} {} → {}",
                    if keyword.active { "🟢" } else { "⚪" },
                    keyword.name,
                    keyword.query
                );
                println!(
                    "     Added {} | {}",
                    keyword.created_at.format("%Y-%m-%d"),
                    match keyword.last_fetch_at {
                        Some(at) => format!("fetched through {}", at.format("%Y-%m-%d %H:%M UTC")),
                        None => "never fetched".to_string(),
                    }
                );
            }
        }
        KeywordCommand::Add {
            name,
            terms,
            logic,
            categories,
        } => {
            let keyword = service.add_keyword(name, terms, *logic, categories)?;
            println!("✅ Tracking {:?} with query: {}", keyword.name, keyword.query);
        }
        KeywordCommand::Remove { name } => {
            service.remove_keyword(name)?;
            println!("✅ Removed {:?} (shard file kept on disk).", name);
        }
        KeywordCommand::Enable { name } => {
            service.set_keyword_active(name, true)?;
            println!("✅ Enabled {:?}.", name);
        }
        KeywordCommand::Disable { name } => {
            service.set_keyword_active(name, false)?;
            println!("✅ Disabled {:?}.", name);
        }
    }
    Ok(0)
}

fn print_cycle(report: &CycleReport) {
    let badge = if report.failed() {
        "❌"
    } else if report.failure_reason().is_some() {
        "⚠️ "
    } else {
        "✅"
    };
    println!("{} {}", badge, report.keyword);
    println!(
        "     New: {} | Duplicates: {} | Summarized: {} | Insights: {:?}",
        report.accepted, report.skipped_duplicate, report.summarized, report.insights_refreshed
    );
    for failure in &report.page_failures {
        println!("     Feed: {}", failure);
    }
    for failure in &report.analysis_failures {
        println!("     Analysis unavailable for {}: {}", failure.paper_id, failure.reason);
    }
    for failure in &report.insight_failures {
        println!("     Insight: {}", failure);
    }
    if let Some(ref error) = report.error {
        println!("     Error: {}", error);
    }
    println!(
        "     Duration: {:.1}s",
        (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
}

fn print_paper(paper: &Paper) {
    println!("  📄 {} [{}]", paper.title, paper.id);
    println!(
        "     {} | {}",
        paper.published_at.format("%Y-%m-%d"),
        paper.authors.join(", ")
    );
    if let Some(ref summary) = paper.summary {
        println!("     {}", summary);
    }
}

fn print_list(title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{}:", title);
    for item in items {
        println!("   - {}", item);
    }
    println!();
}
