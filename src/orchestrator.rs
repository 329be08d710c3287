use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::{LoadFailure, ResultCache};
use crate::client::{GeocodeResult, GeocodeService, GeocodeStatus, RateLimitedClient, ResultSource};
use crate::config::GeocoderConfig;
use crate::errors::{AppError, AppResult};
use crate::ingestion::AddressRecord;
use crate::nominatim::NominatimClient;
use crate::postcode::extract_postcode;
use crate::resolver::{FallbackResolver, Resolution};

pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordResult {
    pub id: String,
    pub result: GeocodeResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub ok: usize,
    pub not_found: usize,
    pub error: usize,
    pub from_cache: usize,
    pub cancelled: usize,
    pub external_calls: u64,
    pub flush_error: Option<String>,
}

impl RunSummary {
    fn record(&mut self, result: &GeocodeResult) {
        match result.status {
            GeocodeStatus::Ok => self.ok += 1,
            GeocodeStatus::NotFound => self.not_found += 1,
            GeocodeStatus::Error => self.error += 1,
        }
        match result.source {
            ResultSource::Cache => self.from_cache += 1,
            ResultSource::Skipped => self.cancelled += 1,
            ResultSource::Postcode | ResultSource::Address => {}
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.ok as f64 / self.total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    /// One entry per input record, in input order.
    pub results: Vec<RecordResult>,
    pub summary: RunSummary,
}

pub struct BatchOrchestrator {
    resolver: Arc<FallbackResolver>,
    cache: Arc<ResultCache>,
    concurrency: usize,
    flush_interval: Option<Duration>,
}

impl BatchOrchestrator {
    pub fn new(config: &GeocoderConfig) -> AppResult<Self> {
        let service = NominatimClient::new(config)?;
        Self::with_service(config, Arc::new(service))
    }

    /// Loads the cache and wires the pipeline around `service`. Fails when the cache store
    /// can be neither read nor written.
    pub fn with_service(
        config: &GeocoderConfig,
        service: Arc<dyn GeocodeService>,
    ) -> AppResult<Self> {
        let cache = Arc::new(ResultCache::load(&config.cache_path));
        if let Err(err) = cache.ensure_writable() {
            if let Some(LoadFailure::Unreadable(reason)) = cache.load_failure() {
                return Err(AppError::CacheStore(format!(
                    "cache store unusable: unreadable ({reason}) and unwritable ({err})"
                )));
            }
            warn!(
                target: "cache",
                error = %err,
                "cache store is not writable; results will not persist"
            );
        }

        let client = RateLimitedClient::from_config(service, config);
        let resolver = FallbackResolver::new(client, cache.clone(), config.postcode_suffix.clone());
        Ok(Self {
            resolver: Arc::new(resolver),
            cache,
            concurrency: config.concurrency.max(1),
            flush_interval: config.flush_interval(),
        })
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub async fn run(
        &self,
        records: Vec<AddressRecord>,
        cancel_flag: Option<CancelFlag>,
    ) -> AppResult<BatchReport> {
        let total = records.len();
        let postcodes = records
            .iter()
            .filter(|record| extract_postcode(&record.raw_address).is_some())
            .count();
        info!(total, postcodes, workers = self.concurrency, "starting geocoding run");

        let ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
        let queue = Arc::new(Mutex::new(
            records.into_iter().enumerate().collect::<VecDeque<_>>(),
        ));
        let cancel_flag = cancel_flag.unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Resolution)>();

        let flusher = self.spawn_periodic_flush();

        let workers = self.concurrency.min(total.max(1));
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let queue = queue.clone();
                let resolver = self.resolver.clone();
                let cancel_flag = cancel_flag.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        if cancel_flag.load(Ordering::SeqCst) {
                            debug!(worker, "stop requested; worker exiting");
                            break;
                        }
                        let next = queue.lock().pop_front();
                        let Some((index, record)) = next else {
                            break;
                        };
                        let resolution = resolver.resolve_until(&record, &cancel_flag).await;
                        debug!(
                            worker,
                            id = %record.id,
                            status = resolution.result.status.as_str(),
                            source = resolution.result.source.as_str(),
                            "record geocoded"
                        );
                        if tx.send((index, resolution)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(tx);

        let mut slots: Vec<Option<GeocodeResult>> = vec![None; total];
        let mut summary = RunSummary {
            total,
            ..RunSummary::default()
        };
        while let Some((index, resolution)) = rx.recv().await {
            summary.external_calls += u64::from(resolution.external_calls);
            slots[index] = Some(resolution.result);
        }

        let mut worker_failure = None;
        for joined in join_all(handles).await {
            if let Err(err) = joined {
                error!(error = %err, "geocoding worker failed");
                worker_failure.get_or_insert_with(|| err.to_string());
            }
        }

        if let Some(stop) = flusher {
            let _ = stop.send(());
        }
        if let Err(err) = flush_off_runtime(self.cache.clone(), ResultCache::flush).await {
            error!(target: "cache", error = %err, "failed to flush geocode cache");
            summary.flush_error = Some(err.to_string());
        }

        if let Some(reason) = worker_failure {
            return Err(AppError::Worker(reason));
        }

        if cancel_flag.load(Ordering::SeqCst) {
            warn!(
                processed = slots
                    .iter()
                    .flatten()
                    .filter(|result| result.source != ResultSource::Skipped)
                    .count(),
                total,
                "run stopped before all records were dispatched"
            );
        }

        let results: Vec<RecordResult> = ids
            .into_iter()
            .zip(slots)
            .map(|(id, slot)| RecordResult {
                id,
                result: slot.unwrap_or_else(GeocodeResult::skipped),
            })
            .collect();
        for record in &results {
            summary.record(&record.result);
        }

        info!(
            total = summary.total,
            ok = summary.ok,
            not_found = summary.not_found,
            error = summary.error,
            from_cache = summary.from_cache,
            cancelled = summary.cancelled,
            external_calls = summary.external_calls,
            "finished geocoding run; success rate {:.2}%",
            summary.success_rate() * 100.0
        );

        Ok(BatchReport { results, summary })
    }

    fn spawn_periodic_flush(&self) -> Option<oneshot::Sender<()>> {
        let period = self.flush_interval?;
        let cache = self.cache.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match flush_off_runtime(cache.clone(), ResultCache::flush_if_dirty).await {
                            Ok(Some(entries)) => debug!(target: "cache", entries, "periodic cache flush"),
                            Ok(None) => {}
                            Err(err) => warn!(target: "cache", error = %err, "periodic cache flush failed"),
                        }
                    }
                }
            }
        });
        Some(stop_tx)
    }
}

/// File writes and fsync block, so flushes run on the blocking pool.
async fn flush_off_runtime<T, F>(cache: Arc<ResultCache>, flush: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(&ResultCache) -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || flush(&*cache))
        .await
        .map_err(|err| AppError::Worker(format!("cache flush task failed: {err}")))?
}
