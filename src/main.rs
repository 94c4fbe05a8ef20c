//! pagerun: scripted end-to-end session orchestrator.
//!
//! Drives a live web application through an ordered sequence of user-like
//! actions, then verifies a final observable state within a time budget.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use pagerun_cli::{config::AppConfig, script};
use pagerun_runner::{RunOrchestrator, RunResult, Verdict};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(
    name = "pagerun",
    about = "Scripted end-to-end session orchestrator",
    version,
    long_version = LONG_VERSION
)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Configuration file (defaults to ./pagerun.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script against a live session and report the verdict
    Run(RunArgs),

    /// Parse and validate a script without acquiring a session
    Validate {
        /// Script file (YAML or JSON)
        script: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Script file (YAML or JSON)
    script: PathBuf,

    /// Override the configured target address
    #[arg(long)]
    target: Option<String>,

    /// Run the browser with a visible window
    #[arg(long)]
    headful: bool,

    /// Directory for failure screenshots
    #[arg(long)]
    screenshot_dir: Option<PathBuf>,

    /// Emit the full run result as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(&cli.log_level) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::from(2);
    }

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Validate { script: path } => {
            let script = script::load_script(&path)?;
            script::validate_script(&script)
                .with_context(|| format!("script {} is invalid", path.display()))?;
            println!(
                "{}: ok ({} steps, {} assertions)",
                script.name,
                script.steps.len(),
                script.assertions.len()
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run(args) => run_command(cli.config.as_deref(), args).await,
    }
}

async fn run_command(config_path: Option<&std::path::Path>, args: RunArgs) -> Result<ExitCode> {
    let mut app_config = AppConfig::load(config_path)?;

    if let Some(target) = args.target {
        app_config.target_address = target;
    }
    if args.headful {
        app_config.headless = false;
    }
    if args.screenshot_dir.is_some() {
        app_config.screenshot_dir = args.screenshot_dir;
    }

    let script = script::load_script(&args.script)?;
    script::validate_script(&script)
        .with_context(|| format!("script {} is invalid", args.script.display()))?;

    // A script may pin its own target address.
    if let Some(target) = &script.target {
        app_config.target_address = target.clone();
    }

    info!(
        script = %script.name,
        target = %app_config.target_address,
        "starting run"
    );

    let config = app_config.into_runner_config();
    let orchestrator = RunOrchestrator::new(config);
    let result = orchestrator.run(&script).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    Ok(exit_code_for(&result))
}

fn print_summary(result: &RunResult) {
    let duration =
        humantime::format_duration(std::time::Duration::from_millis(result.duration_ms));

    for step in &result.steps {
        let label = step.label.as_deref().unwrap_or(&step.action);
        match &step.outcome {
            pagerun_runner::StepOutcome::Success => {
                println!("  step {:>2} {label}: ok ({}ms)", step.position, step.latency_ms);
            }
            pagerun_runner::StepOutcome::Skipped { reason } => {
                println!("  step {:>2} {label}: skipped ({reason})", step.position);
            }
            pagerun_runner::StepOutcome::Failed { reason } => {
                println!("  step {:>2} {label}: FAILED ({reason})", step.position);
            }
        }
    }

    match &result.verdict {
        Verdict::Pass => println!("{}: PASSED in {duration}", result.script),
        Verdict::Fail {
            reason,
            last_observed,
        } => {
            println!("{}: FAILED in {duration}", result.script);
            println!("  reason: {reason}");
            if !last_observed.is_empty() {
                println!("  last observed state:\n---\n{last_observed}\n---");
            }
            if let Some(screenshot) = &result.screenshot {
                println!("  screenshot: {}", screenshot.display());
            }
        }
    }
}

fn exit_code_for(result: &RunResult) -> ExitCode {
    match &result.verdict {
        Verdict::Pass => ExitCode::SUCCESS,
        Verdict::Fail { reason, .. } if reason.starts_with("session acquire failed") => {
            // Nothing was tested; distinguish from a genuine test failure.
            ExitCode::from(2)
        }
        Verdict::Fail { .. } => ExitCode::from(1),
    }
}

fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
