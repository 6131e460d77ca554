//! Risk Monitor
//!
//! Reads a JSON-lines feed of risk events and writes one decision per event
//! to stdout. Logs go to stderr.

mod monitor;
mod sink;

use anyhow::{Context, Result};
use clap::Parser;
use risk_manager::{GuardConfig, RiskDecisionCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::monitor::RiskMonitor;
use crate::sink::LogAlertSink;

#[derive(Parser, Debug)]
#[command(name = "risk-monitor")]
#[command(about = "Intraday circuit breaker and trailing-exit monitor", long_about = None)]
struct Cli {
    /// Config file path (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON-lines event feed; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Number of scan workers
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "risk_monitor=info,risk_manager=info,guard_core=warn".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Starting Risk Monitor");

    // Load configuration
    let config = GuardConfig::load(cli.config.as_deref())?;
    let coordinator = Arc::new(RiskDecisionCoordinator::new(config)?);

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open feed {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let monitor = RiskMonitor::new(coordinator, Arc::new(LogAlertSink), cli.workers);
    let (summary, _) = monitor.run(input, tokio::io::stdout()).await?;
    monitor.log_summary(&summary);

    Ok(())
}
