//! Golden Path CLI
//!
//! ```bash
//! # Record the baseline
//! golden-path --accounts accounts.json --topology fleet.json discover
//!
//! # Verify it before a release, only patterns with traffic
//! golden-path --accounts accounts.json --topology fleet.json pre-release --only-with-traffic
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use golden_path::aws::fixture::{RecordedFleet, RecordedTopology};
use golden_path::config::EngineConfig;
use golden_path::golden_path::GoldenPathStore;
use golden_path::report::{JsonFilePublisher, LogPublisher};
use golden_path::session::SessionCache;
use golden_path::types::{Account, ConnectionKind, Phase};
use golden_path::verification::VerifyFilter;
use golden_path::{Engine, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "golden-path", version, about = "Network connectivity discovery and golden path verification")]
struct Cli {
    /// JSON file listing the accounts taking part
    #[arg(long, env = "GOLDEN_PATH_ACCOUNTS")]
    accounts: PathBuf,

    /// Recorded network topology to replay
    #[arg(long, env = "GOLDEN_PATH_TOPOLOGY")]
    topology: PathBuf,

    /// Golden path document
    #[arg(long, default_value = "golden_path.json", env = "GOLDEN_PATH_FILE")]
    golden_path: PathBuf,

    /// Directory run summaries are written to
    #[arg(long, env = "GOLDEN_PATH_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Connection kinds to include (hub, peering, vpn, endpoint)
    #[arg(long, value_delimiter = ',', env = "GOLDEN_PATH_KINDS")]
    kinds: Vec<ConnectionKind>,

    /// Concurrent verification checks
    #[arg(long, env = "GOLDEN_PATH_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Log output format
    #[arg(long, value_enum, default_value = "json", env = "GOLDEN_PATH_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover connectivity and replace the golden path
    Discover,

    /// Verify the golden path before a release
    PreRelease(VerifyArgs),

    /// Verify the golden path after a release
    PostRelease(VerifyArgs),
}

#[derive(clap::Args, Debug)]
struct VerifyArgs {
    /// Only verify patterns with observed traffic
    #[arg(long)]
    only_with_traffic: bool,

    /// Extra ports to check on path-analysed patterns
    #[arg(long, value_delimiter = ',')]
    ports: Vec<u16>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let accounts = load_accounts(&cli.accounts)?;
    let topology = RecordedTopology::load(&cli.topology)
        .with_context(|| format!("Failed to load topology {}", cli.topology.display()))?;

    let mut config = EngineConfig::from_env();
    if let Some(concurrency) = cli.concurrency {
        config.verify_concurrency = concurrency.max(1);
    }

    let sessions = Arc::new(SessionCache::new(
        Arc::new(RecordedFleet::from_topology(topology)),
        &config.session,
    ));
    let mut engine = Engine::new(accounts, sessions, config, GoldenPathStore::new(&cli.golden_path))
        .with_publisher(Arc::new(LogPublisher));
    if let Some(dir) = &cli.results_dir {
        engine = engine.with_publisher(Arc::new(JsonFilePublisher::new(dir)));
    }

    let mut options = RunOptions::default();
    if !cli.kinds.is_empty() {
        options.kinds = cli.kinds.clone();
    }
    let phase = match &cli.command {
        Command::Discover => Phase::Discover,
        Command::PreRelease(args) | Command::PostRelease(args) => {
            options.filter = VerifyFilter {
                kinds: cli.kinds.iter().copied().collect(),
                only_with_traffic: args.only_with_traffic,
                extra_ports: args.ports.clone(),
            };
            if matches!(cli.command, Command::PreRelease(_)) {
                Phase::PreRelease
            } else {
                Phase::PostRelease
            }
        }
    };

    info!(phase = %phase, golden_path = %cli.golden_path.display(), "Starting golden path run");

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
        }
    };

    match engine.run(phase, &options, shutdown).await {
        Ok(summary) if summary.is_success() => Ok(ExitCode::SUCCESS),
        Ok(summary) => {
            error!(failed = summary.counts.failed, "Verification failures detected");
            Ok(ExitCode::from(1))
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            Ok(ExitCode::from(2))
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_accounts(path: &Path) -> Result<Vec<Account>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read accounts file {}", path.display()))?;
    let accounts: Vec<Account> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse accounts file {}", path.display()))?;
    anyhow::ensure!(!accounts.is_empty(), "Accounts file {} lists no accounts", path.display());
    Ok(accounts)
}
