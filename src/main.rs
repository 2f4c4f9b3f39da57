use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use address_resolver::{
    init_tracing, load_feed, BatchProgress, BatchStatus, EngineConfig, GeocodingService,
    ProgressObserver, ResolutionEngine,
};

const EXIT_OK: u8 = 0;
const EXIT_BELOW_TARGET: u8 = 1;
const EXIT_ABORTED: u8 = 2;
const EXIT_CANCELLED: u8 = 130;
const PROGRESS_EVERY: usize = 10;

#[derive(Parser)]
#[command(name = "address-resolver")]
#[command(about = "Geocode a spreadsheet of business addresses with fallbacks and manual overrides")]
#[command(version)]
struct Cli {
    /// CSV export of the feed (local path or http(s) URL)
    #[arg(long, short = 'f', env = "ADDRESS_FEED")]
    feed: String,

    /// JSON file mapping verbatim addresses to [lat, lon]
    #[arg(long, env = "MANUAL_OVERRIDES_FILE")]
    overrides: Option<PathBuf>,

    /// Write the report here instead of stdout
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Records resolved concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Provider calls per second across all workers
    #[arg(long)]
    qps: Option<u32>,

    /// Region code appended to queries that lack it (e.g. KY)
    #[arg(long)]
    region_code: Option<String>,

    /// Full region name used to recognise and rank results (e.g. Kentucky)
    #[arg(long)]
    region_name: Option<String>,

    /// Exit non-zero when the success rate falls below this fraction
    #[arg(long)]
    min_success_rate: Option<f64>,
}

impl Cli {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(path) = &self.overrides {
            config.overrides_file = Some(path.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(qps) = self.qps {
            config.rate_limit_qps = qps;
        }
        if let Some(code) = &self.region_code {
            config.region_code = Some(code.clone());
        }
        if let Some(name) = &self.region_name {
            config.region_name = Some(name.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    cli.apply(&mut config);

    let service = GeocodingService::new(&config).context("failed to build geocoding client")?;
    let engine = ResolutionEngine::from_config(&config, service, None)
        .context("invalid resolver configuration")?;
    let records = load_feed(&cli.feed)
        .await
        .with_context(|| format!("failed to load feed {}", cli.feed))?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing current records");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }
    let observer: ProgressObserver = Arc::new(|progress: BatchProgress| {
        if progress.processed % PROGRESS_EVERY == 0 || progress.processed == progress.total {
            info!(
                processed = progress.processed,
                total = progress.total,
                placed = progress.placed,
                "progress"
            );
        }
    });

    let report = engine.run(records, Some(observer), Some(cancel)).await;
    let json = serde_json::to_string_pretty(&report)?;
    match &cli.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }

    for failure in &report.failures {
        warn!(
            row = failure.row_number,
            name = %failure.name,
            address = %failure.raw_address,
            "unresolved; add a manual override for this address"
        );
    }
    for (kind, failures) in &report.failures_by_kind {
        warn!(%kind, count = failures.len(), "unresolved records by last error");
    }

    if let BatchStatus::Aborted { reason } = &report.status {
        warn!(%reason, "batch aborted");
    }
    let code = exit_code(
        &report.status,
        report.summary.success_rate,
        cli.min_success_rate,
    );
    if code == EXIT_CANCELLED {
        warn!("batch cancelled; report is partial");
    } else if code == EXIT_BELOW_TARGET {
        warn!(
            success_rate = report.summary.success_rate,
            "success rate below target"
        );
    }
    Ok(ExitCode::from(code))
}

/// Aborted and cancelled runs take precedence over the success-rate target.
fn exit_code(status: &BatchStatus, success_rate: f64, min_success_rate: Option<f64>) -> u8 {
    match status {
        BatchStatus::Aborted { .. } => EXIT_ABORTED,
        BatchStatus::Cancelled => EXIT_CANCELLED,
        BatchStatus::Completed => match min_success_rate {
            Some(target) if success_rate < target => EXIT_BELOW_TARGET,
            _ => EXIT_OK,
        },
    }
}
