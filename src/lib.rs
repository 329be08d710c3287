mod cache;
mod client;
mod config;
mod errors;
mod ingestion;
mod nominatim;
mod orchestrator;
mod postcode;
mod resolver;

use std::fs::OpenOptions;
use std::sync::Mutex as StdMutex;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::{CacheEntry, KeyClaim, LoadFailure, QueryKey, ResultCache};
pub use client::{
    ClientResponse, Coordinates, GeocodeResult, GeocodeService, GeocodeStatus, RateLimitedClient,
    RateLimiter, ResultSource, RetryPolicy, RetryState,
};
pub use config::{GeocoderConfig, LogLevel};
pub use errors::{AppError, AppResult, ServiceError};
pub use ingestion::{emit_results, parse_records, read_records, write_results, AddressRecord};
pub use nominatim::NominatimClient;
pub use orchestrator::{BatchOrchestrator, BatchReport, CancelFlag, RecordResult, RunSummary};
pub use postcode::extract_postcode;
pub use resolver::{FallbackResolver, Resolution};

/// Installs the global subscriber once. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &GeocoderConfig) -> AppResult<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "warn,batch_geocoder={level},cache={level}",
                level = config.log_level
            ))
        });

        let file_layer = match &config.log_file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(StdMutex::new(file)),
                )
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(file_layer)
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to install tracing: {err}")))
    })?;
    Ok(())
}
