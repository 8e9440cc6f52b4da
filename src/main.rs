use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use scrapeflow::config::AppConfig;
use scrapeflow::engine::{ExecutionIteratorConfig, ExecutionRequest, RunManager, RunResult};
use scrapeflow::logging::{init_logging, LogContext};
use scrapeflow::page::simplifier;
use scrapeflow::program::Program;
use scrapeflow::storage::StorageManager;

#[derive(Parser)]
#[command(name = "scrapeflow")]
#[command(about = "ScrapeFlow command line interface")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, help = "Configuration file path")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a program file (JSON or YAML)
    Validate {
        #[arg(help = "Path to program file")]
        program: PathBuf,
    },

    /// Save a program as a scraper
    Import {
        #[arg(help = "Path to program file")]
        program: PathBuf,

        #[arg(short, long, help = "Scraper name")]
        name: String,
    },

    /// List saved scrapers
    List,

    /// Run a saved scraper, streaming its events as JSON lines
    Run {
        #[arg(help = "Scraper ID")]
        scraper_id: String,

        #[arg(long, help = "Iterate over a range, as start:end[:step]", conflicts_with = "store")]
        range: Option<String>,

        #[arg(long, help = "Iterate over every row of a data store")]
        store: Option<String>,

        #[arg(long, help = "Abort remaining iterations after the first failure")]
        stop_on_error: bool,

        #[arg(long, help = "Suppress notifications")]
        silent: bool,
    },

    /// Print the simplified form of an HTML file
    Simplify {
        #[arg(help = "Path to HTML file")]
        html_file: PathBuf,

        #[arg(long, default_value = "about:blank", help = "URI relative links resolve against")]
        base_uri: String,

        #[arg(long, default_value_t = simplifier::DEFAULT_MAX_BYTES, help = "Output byte budget")]
        max_bytes: usize,
    },

    /// Serve the HTTP API
    #[cfg(feature = "api")]
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path).await?,
        None => AppConfig::load().await?,
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config.logging)?;

    let context = LogContext::new("main", "startup").with_string_field("version", env!("CARGO_PKG_VERSION"));
    scrapeflow::log_debug!(context, "ScrapeFlow CLI starting");

    match cli.command {
        Commands::Validate { program } => validate_program(&program).await,
        Commands::Import { program, name } => import_program(&config, &program, &name).await,
        Commands::List => list_scrapers(&config).await,
        Commands::Run {
            scraper_id,
            range,
            store,
            stop_on_error,
            silent,
        } => {
            let iterator_config = match (range, store) {
                (Some(range), _) => Some(parse_range(&range)?),
                (None, Some(store)) => Some(ExecutionIteratorConfig::EntireSet { store }),
                (None, None) => None,
            };
            let request = ExecutionRequest {
                scraper_id,
                iterator_config,
                stop_on_error: stop_on_error.then_some(true),
                silent,
            };
            run_scraper(&config, request).await
        }
        Commands::Simplify {
            html_file,
            base_uri,
            max_bytes,
        } => {
            let html = tokio::fs::read_to_string(&html_file)
                .await
                .with_context(|| format!("reading {}", html_file.display()))?;
            println!("{}", simplifier::simplify(&html, &base_uri, max_bytes));
            Ok(())
        }
        #[cfg(feature = "api")]
        Commands::Serve => {
            config.ensure_directories().await?;
            let manager = RunManager::from_config(&config).await?;
            scrapeflow::api::serve(manager, &config.api).await
        }
    }
}

async fn read_program(path: &Path) -> Result<Program> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let program = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Program::from_yaml(&content)?,
        _ => Program::from_json(&content)?,
    };
    Ok(program)
}

async fn validate_program(path: &Path) -> Result<()> {
    match read_program(path).await {
        Ok(program) => {
            println!("Program is valid: {} instructions, digest {}", program.len(), program.digest()?);
            Ok(())
        }
        Err(e) => {
            error!("Program validation failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn import_program(config: &AppConfig, path: &Path, name: &str) -> Result<()> {
    let program = read_program(path).await?;
    config.ensure_directories().await?;
    let storage = StorageManager::new(&config.database).await?;
    let record = storage.save_scraper(name, &program).await?;

    info!("Imported scraper {} as {}", name, record.id);
    println!("{}", record.id);
    Ok(())
}

async fn list_scrapers(config: &AppConfig) -> Result<()> {
    let storage = StorageManager::new(&config.database).await?;
    let scrapers = storage.list_scrapers().await?;

    println!("{:<36} {:<24} {:<8} {:<20}", "Scraper ID", "Name", "Steps", "Updated");
    println!("{}", "-".repeat(91));

    for scraper in scrapers {
        println!(
            "{:<36} {:<24} {:<8} {:<20}",
            scraper.id,
            scraper.name.chars().take(24).collect::<String>(),
            scraper.program.len(),
            scraper.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn run_scraper(config: &AppConfig, request: ExecutionRequest) -> Result<()> {
    config.ensure_directories().await?;
    let manager = RunManager::from_config(config).await?;
    let (run_id, mut events) = manager.execute_with_events(request).await?;
    info!("Run {} started", run_id);

    loop {
        match events.recv().await {
            Ok(envelope) => println!("{}", serde_json::to_string(&envelope)?),
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }

    match manager.wait(run_id).await? {
        RunResult::Success => Ok(()),
        RunResult::Error { error } => Err(anyhow::anyhow!("run {} failed: {:?}: {}", run_id, error.kind, error.message)),
    }
}

fn parse_range(raw: &str) -> Result<ExecutionIteratorConfig> {
    let parts: Vec<&str> = raw.split(':').collect();
    let number = |part: &str| {
        part.trim()
            .parse::<i64>()
            .with_context(|| format!("invalid range bound '{}'", part))
    };

    let (start, end, step) = match parts.as_slice() {
        [start, end] => (number(start)?, number(end)?, 1),
        [start, end, step] => (number(start)?, number(end)?, number(step)?),
        _ => anyhow::bail!("range must be start:end or start:end:step"),
    };
    Ok(ExecutionIteratorConfig::Range { start, end, step })
}
