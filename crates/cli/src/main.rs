//! CLI entry point for the MP4 batch converter
//!
//! `mp4-batch run <SOURCE_ROOT> [LEDGER]` converts every pending item under
//! the source root. With a ledger the run is resumable; without one, every
//! discovered item is converted once.

use clap::{Parser, Subcommand};
use mp4_batch::{
    prepare_run, run_startup_checks, BatchRunner, Config, ConsoleReporter, DiscoveryRules,
    HandBrake, ItemDriver, RunContext, RunObserver, SourceLayout,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Resumable batch conversion of DVD images and video directories to MP4
#[derive(Parser, Debug)]
#[command(name = "mp4-batch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert every pending item under SOURCE_ROOT
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory containing the work items
    source_root: PathBuf,

    /// CSV ledger tracking per-item progress; omit for a one-shot run
    ledger: Option<PathBuf>,

    /// Path to a configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Item layout: `disc` (VIDEO_TS directories) or `files` (loose media)
    #[arg(short, long)]
    layout: Option<SourceLayout>,

    /// Start without asking for confirmation
    #[arg(short, long, default_value = "false")]
    yes: bool,

    /// Skip the engine availability check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: RunArgs) -> ExitCode {
    let config = match Config::load_or_default(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // A ledger implies the loose-files workflow unless told otherwise.
    let layout = args
        .layout
        .or(config.discovery.layout)
        .unwrap_or(if args.ledger.is_some() {
            SourceLayout::Files
        } else {
            SourceLayout::Disc
        });

    if args.skip_checks {
        println!("WARNING: Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        eprintln!("Startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let rules = DiscoveryRules::new(layout, &config.discovery);
    let prepared = match prepare_run(&args.source_root, args.ledger.as_deref(), &rules) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let plan = prepared.plan;

    if let Some(path) = prepared.ledger.path() {
        println!(
            "Loaded ledger {} with {} entries",
            path.display(),
            prepared.ledger.len()
        );
    }

    if !plan.invalid.is_empty() {
        println!("\nThe following directories are invalid (nothing to convert):");
        for item in &plan.invalid {
            println!("- {}: {}", item.identifier, item.path.display());
        }
    }

    if !plan.already_complete.is_empty() {
        println!("Skipping {} already finished items", plan.already_complete.len());
    }

    if plan.is_empty() {
        println!("\nNo valid directories to process.");
        return ExitCode::SUCCESS;
    }

    println!("\nFound {} valid {} items to process.", plan.len(), layout);

    if !args.yes && !confirm("Do you want to proceed with the conversion? (y/n): ").await {
        println!("Operation cancelled.");
        return ExitCode::SUCCESS;
    }

    let stall_timeout = (config.engine.stall_timeout_secs > 0)
        .then(|| Duration::from_secs(config.engine.stall_timeout_secs));
    tracing::info!(
        engine = %config.engine.program,
        layout = %layout,
        stall_timeout_secs = config.engine.stall_timeout_secs,
        "Starting batch"
    );
    let engine = Arc::new(HandBrake::new(config.engine.program.clone(), stall_timeout));
    let observer: Arc<dyn RunObserver> = Arc::new(ConsoleReporter::new());
    let driver = Arc::new(ItemDriver::new(engine, rules, observer.clone()));

    let mut runner = BatchRunner::new(RunContext {
        ledger: prepared.ledger,
        driver,
        observer,
    });

    match runner.run(&plan).await {
        Ok(summary) => {
            println!(
                "All items have been processed! {} succeeded, {} failed.",
                summary.succeeded, summary.failed
            );
            if summary.persist_failures > 0 {
                eprintln!(
                    "Warning: {} ledger updates failed; rerun to reconcile.",
                    summary.persist_failures
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Ask a single yes/no question on stdin. Anything but `y` declines.
async fn confirm(prompt: &str) -> bool {
    print!("{}", prompt);
    let _ = std::io::Write::flush(&mut std::io::stdout());

    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await;

    matches!(answer, Ok(Ok(line)) if line.trim().eq_ignore_ascii_case("y"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_resumable_invocation() {
        let cli = Cli::try_parse_from([
            "mp4-batch", "run", "/videos", "/videos/tracking.csv", "--layout", "disc", "-y",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command;

        assert_eq!(args.source_root, PathBuf::from("/videos"));
        assert_eq!(args.ledger, Some(PathBuf::from("/videos/tracking.csv")));
        assert_eq!(args.layout, Some(SourceLayout::Disc));
        assert!(args.yes);
        assert!(!args.skip_checks);
    }

    #[test]
    fn test_parse_one_shot_invocation() {
        let cli = Cli::try_parse_from(["mp4-batch", "run", "/dvds"]).unwrap();
        let Commands::Run(args) = cli.command;

        assert_eq!(args.ledger, None);
        assert_eq!(args.layout, None);
    }

    #[test]
    fn test_missing_source_root_is_rejected() {
        assert!(Cli::try_parse_from(["mp4-batch", "run"]).is_err());
    }

    #[test]
    fn test_unknown_layout_is_rejected() {
        assert!(Cli::try_parse_from(["mp4-batch", "run", "/dvds", "--layout", "bluray"]).is_err());
    }
}
