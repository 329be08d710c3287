use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use batch_geocoder::{init_tracing, read_records, write_results, BatchOrchestrator, GeocoderConfig};

/// Geocode a CSV of addresses, postcode first, within the service's rate limit.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// CSV with an `address` column and an optional `id` column.
    #[arg(short, long, env = "GEOCODER_INPUT_CSV")]
    input: PathBuf,
    /// Where to write `id,latitude,longitude,status,source` rows.
    #[arg(short, long, env = "GEOCODER_OUTPUT_CSV")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GeocoderConfig::from_env().context("invalid geocoder configuration")?;
    init_tracing(&config)?;

    let records = read_records(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let orchestrator = BatchOrchestrator::new(&config)?;

    let cancel_flag = Arc::new(AtomicBool::new(false));
    {
        let cancel_flag = cancel_flag.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight lookups");
                cancel_flag.store(true, Ordering::SeqCst);
            }
        });
    }

    let report = orchestrator.run(records, Some(cancel_flag)).await?;
    write_results(&cli.output, &report.results)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;

    let summary = &report.summary;
    info!(
        total = summary.total,
        geocoded = summary.ok,
        "success rate {:.2}%",
        summary.success_rate() * 100.0
    );
    if let Some(err) = &summary.flush_error {
        warn!(error = %err, "cache was not saved; the next run will repeat these lookups");
    }
    Ok(())
}
