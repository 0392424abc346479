use clap::Parser;
use coin_ranker::comfy_table::print_report;
use coin_ranker::storage_utils::{AppConfig, AsyncStorageManager};
use coin_ranker::{analysis, report, tui};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Ranks coins by a technical-indicator score and suggests an allocation")]
struct Cli {
    /// Config file to use instead of <storage>/config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage directory for config.json and results.json (default: next to the binary)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Number of coins to keep in the portfolio
    #[arg(long)]
    top: Option<usize>,

    /// Scoring policy: balanced or conservative
    #[arg(long)]
    policy: Option<String>,

    /// Markdown report path; overrides the config
    #[arg(long)]
    markdown: Option<PathBuf>,

    /// Skip the markdown report
    #[arg(long, conflicts_with = "markdown")]
    no_markdown: bool,

    /// Open the interactive view instead of printing once
    #[arg(long)]
    tui: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

/// Log lines written to stderr would tear the alternate screen, so the
/// interactive view runs silent unless `RUST_LOG` asks otherwise.
fn log_level(quiet: bool, tui: bool) -> log::LevelFilter {
    if tui {
        log::LevelFilter::Off
    } else if quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(log_level(args.quiet, args.tui))
        .parse_default_env()
        .init();
    log::debug!("Parsed arguments: {:?}", args);

    // Step 1: Load Config
    let storage = match &args.storage {
        Some(dir) => AsyncStorageManager::new(dir.clone()).await?,
        None => AsyncStorageManager::new_relative("storage").await?,
    };
    let mut config: AppConfig = match &args.config {
        Some(path) => {
            let content = tokio::fs::read(path).await?;
            serde_json::from_slice(&content)?
        }
        None => storage.load_or_init_config().await?,
    };
    if let Some(top) = args.top {
        config.portfolio.top_k = top;
    }
    if let Some(policy) = args.policy {
        config.scoring.policy = policy;
    }
    if let Some(path) = args.markdown {
        config.report.markdown_path = Some(path);
    }
    if args.no_markdown {
        config.report.markdown_path = None;
    }
    config.validate()?;

    if args.tui {
        return tui::run_tui(config, &storage).await;
    }

    // Step 2: Fetch, Score and Rank
    let ranking = match analysis::run_analysis_pipeline(&config, &storage).await {
        Ok(ranking) => ranking,
        Err(e) => {
            log::error!("Ranking failed: {:#}", e);
            return Err(e);
        }
    };

    // Step 3: Write Reports
    if let Err(e) = report::publish(&config.report, &ranking).await {
        log::error!("Could not write markdown report: {:#}", e);
    }

    // Step 4: Display Results
    print_report(&ranking);

    Ok(())
}
