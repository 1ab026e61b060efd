//! Hypoforge CLI: submit, step, drive and inspect hypothesis pipeline runs.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Hypoforge: turn market needs and technical assets into scored business hypotheses
#[derive(Parser, Debug)]
#[command(name = "hypoforge", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Store file (overrides store.data_file)
    #[arg(long, global = true)]
    data_file: Option<PathBuf>,

    /// AI provider: gemini or mock
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Store two input documents and create a pending run
    Submit {
        /// Project the run belongs to
        #[arg(long, default_value = "1")]
        project: i64,
        /// Name of the job, used when no hypothesis can be extracted
        #[arg(long)]
        job_name: String,
        /// Number of hypotheses to ask for
        #[arg(long, default_value = "5")]
        count: u32,
        /// Target specification document
        target_spec: PathBuf,
        /// Technical assets document
        technical_assets: PathBuf,
        /// Steer research away from hypotheses of earlier runs in the project
        #[arg(long)]
        exclude_existing: bool,
    },
    /// Execute exactly one step of a run
    Step {
        /// Run ID
        run_id: i64,
    },
    /// Execute steps until the run has no more work
    Drive {
        /// Run ID
        run_id: i64,
    },
    /// Resume runs that stopped making progress
    Sweep {
        /// Keep sweeping every runner.sweep_interval_secs
        #[arg(long)]
        watch: bool,
    },
    /// Show a run and its hypotheses
    Status {
        /// Run ID
        run_id: i64,
    },
    /// Parse an evaluation report and check its weighted total
    Score {
        /// Report file
        file: PathBuf,
        /// Rubric the report follows
        #[arg(long, value_enum, default_value = "business")]
        rubric: RubricArg,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RubricArg {
    Business,
    Technical,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

/// Flags that override the loaded configuration.
#[derive(Debug, Clone, Default)]
struct Overrides {
    data_file: Option<PathBuf>,
    provider: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = hypoforge_core::config::data_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "hypoforge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let overrides = Overrides {
        data_file: cli.data_file,
        provider: cli.provider,
    };
    commands::handle_command(cli.command, &workspace, &overrides).await
}
