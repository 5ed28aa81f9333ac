use anyhow::{Context, Result};
use canopy::oracle::{HeuristicOracle, LlmOracle, SharedOracle};
use canopy::{ConsolidationError, ConsolidationPipeline, Settings, Theme};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CANOPY_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "canopy",
    about = "Consolidate change themes into a deduplicated, drill-down theme tree",
    version
)]
struct Args {
    /// JSON file holding an array of flat themes
    themes: PathBuf,

    /// Config file (defaults to ~/.config/canopy/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Answer every judgment with local heuristics instead of the LLM
    #[arg(long)]
    offline: bool,

    /// Skip recursive expansion
    #[arg(long)]
    no_expand: bool,

    /// Write the tree here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print run metrics to stderr
    #[arg(long)]
    metrics: bool,

    /// Exit non-zero when the integrity check finds problems
    #[arg(long)]
    strict: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("canopy=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load_required(path)?,
        None => Settings::load(),
    };
    let mut config = settings.consolidation.clone();
    if args.no_expand {
        config.expansion = false;
    }

    let raw = std::fs::read_to_string(&args.themes)
        .with_context(|| format!("Failed to read {}", args.themes.display()))?;
    let themes: Vec<Theme> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse themes from {}", args.themes.display()))?;

    let llm = if args.offline {
        None
    } else {
        Some(Arc::new(LlmOracle::new(settings.api_key(), &settings.oracle)?))
    };
    let oracle: SharedOracle = match &llm {
        Some(llm) => llm.clone(),
        None => Arc::new(HeuristicOracle::new()),
    };

    let pipeline = ConsolidationPipeline::new(oracle, config);
    let outcome = match pipeline.run(themes).await {
        Ok(outcome) => outcome,
        Err(ConsolidationError::Configuration(reason)) => {
            eprintln!("  ✗ {}", reason);
            eprintln!("    Run with --offline to use local heuristics instead.");
            std::process::exit(2);
        }
        Err(err) => return Err(err.into()),
    };

    let tree = serde_json::to_string_pretty(&outcome.roots)?;
    match &args.output {
        Some(path) => std::fs::write(path, tree + "\n")
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", tree),
    }

    for warning in &outcome.warnings {
        eprintln!("  ! {}", warning);
    }
    if args.metrics {
        eprintln!("{}", serde_json::to_string_pretty(&outcome.metrics)?);
        if let Some(llm) = &llm {
            let usage = llm.usage();
            eprintln!(
                "  tokens: {} (${:.4})",
                usage.total_tokens,
                usage.cost()
            );
        }
    }

    if args.strict && !outcome.integrity.valid {
        eprintln!(
            "  ✗ integrity check failed with {} issue(s)",
            outcome.integrity.issues.len()
        );
        std::process::exit(1);
    }
    Ok(())
}
