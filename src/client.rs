use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace, warn};

use crate::config::GeocoderConfig;
use crate::errors::ServiceError;

const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeocodeStatus {
    Ok,
    NotFound,
    Error,
}

impl GeocodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodeStatus::Ok => "OK",
            GeocodeStatus::NotFound => "NOT_FOUND",
            GeocodeStatus::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultSource {
    Postcode,
    Address,
    Cache,
    /// The run was stopped before this record could be resolved.
    Skipped,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Postcode => "POSTCODE",
            ResultSource::Address => "ADDRESS",
            ResultSource::Cache => "CACHE",
            ResultSource::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: GeocodeStatus,
    pub source: ResultSource,
}

impl GeocodeResult {
    pub fn found(coordinates: Coordinates, source: ResultSource) -> Self {
        Self {
            latitude: Some(coordinates.latitude),
            longitude: Some(coordinates.longitude),
            status: GeocodeStatus::Ok,
            source,
        }
    }

    pub fn not_found(source: ResultSource) -> Self {
        Self {
            latitude: None,
            longitude: None,
            status: GeocodeStatus::NotFound,
            source,
        }
    }

    pub fn error(source: ResultSource) -> Self {
        Self {
            latitude: None,
            longitude: None,
            status: GeocodeStatus::Error,
            source,
        }
    }

    pub fn skipped() -> Self {
        Self::error(ResultSource::Skipped)
    }

    pub fn from_response(response: &ClientResponse, source: ResultSource) -> Self {
        if response.cancelled {
            return Self::skipped();
        }
        match (response.status, response.coordinates) {
            (GeocodeStatus::Ok, Some(coordinates)) => Self::found(coordinates, source),
            (GeocodeStatus::NotFound, _) => Self::not_found(source),
            _ => Self::error(source),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == GeocodeStatus::Ok
    }

    /// OK and NOT_FOUND outcomes are definitive and may be reused without asking again.
    pub fn is_definitive(&self) -> bool {
        matches!(self.status, GeocodeStatus::Ok | GeocodeStatus::NotFound)
    }

    pub fn with_source(mut self, source: ResultSource) -> Self {
        self.source = source;
        self
    }
}

#[async_trait]
pub trait GeocodeService: Send + Sync {
    /// Returns the best match for `query`, or `None` when the service knows no match.
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, ServiceError>;
}

/// Enforces a minimum interval between the starts of successive outbound calls.
/// One instance is shared by every worker.
pub struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits for permission to call. The check and the recorded call time happen
    /// under one lock, so two workers can never pass for the same slot.
    pub async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    BackingOff { attempt: u32, delay: Duration },
    Exhausted { attempts: u32, last_error: ServiceError },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    /// `max_retries` is the total number of attempts per query; at least one attempt is made.
    pub fn new(max_retries: u32, base_delay: Duration, jitter: bool) -> Self {
        Self {
            max_attempts: max_retries.max(1),
            base_delay,
            jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(1 << exponent)
    }

    /// Next state after attempt `attempt` failed with `error`.
    pub fn after_failure(&self, attempt: u32, error: ServiceError) -> RetryState {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return RetryState::Exhausted {
                attempts: attempt,
                last_error: error,
            };
        }
        RetryState::BackingOff {
            attempt,
            delay: self.delay_for(attempt),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    pub status: GeocodeStatus,
    pub coordinates: Option<Coordinates>,
    pub attempts: u32,
    pub backoff_delays: Vec<Duration>,
    pub error: Option<ServiceError>,
    /// The stop signal arrived before the next attempt could be sent.
    pub cancelled: bool,
}

impl ClientResponse {
    fn finished(
        status: GeocodeStatus,
        coordinates: Option<Coordinates>,
        attempts: u32,
        backoff_delays: Vec<Duration>,
    ) -> Self {
        Self {
            status,
            coordinates,
            attempts,
            backoff_delays,
            error: None,
            cancelled: false,
        }
    }

    fn stopped(attempts: u32, backoff_delays: Vec<Duration>) -> Self {
        Self {
            status: GeocodeStatus::Error,
            coordinates: None,
            attempts,
            backoff_delays,
            error: None,
            cancelled: true,
        }
    }
}

/// Wraps a [`GeocodeService`] with the shared rate limiter, a per-attempt timeout and
/// exponential backoff. Failures come back as `GeocodeStatus::Error`, never as `Err`.
#[derive(Clone)]
pub struct RateLimitedClient {
    service: Arc<dyn GeocodeService>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    request_timeout: Duration,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl RateLimitedClient {
    pub fn new(
        service: Arc<dyn GeocodeService>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            service,
            limiter,
            policy,
            request_timeout,
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn from_config(service: Arc<dyn GeocodeService>, config: &GeocoderConfig) -> Self {
        Self::new(
            service,
            Arc::new(RateLimiter::new(config.rate_limit_interval())),
            config.retry_policy(),
            config.request_timeout(),
        )
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn query(&self, text: &str) -> ClientResponse {
        self.query_until(text, &AtomicBool::new(false)).await
    }

    /// Like [`query`](Self::query), but sends nothing once `stop` is set. An attempt already
    /// on the wire runs to completion; waiting for a rate-limit slot or a backoff does not
    /// count as being on the wire.
    pub async fn query_until(&self, text: &str, stop: &AtomicBool) -> ClientResponse {
        let mut backoff_delays = Vec::new();
        let mut state = RetryState::Attempting { attempt: 1 };
        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    if stop.load(Ordering::SeqCst) {
                        return ClientResponse::stopped(attempt - 1, backoff_delays);
                    }
                    self.limiter.wait().await;
                    if stop.load(Ordering::SeqCst) {
                        debug!(query = text, attempt, "stop requested; request not sent");
                        return ClientResponse::stopped(attempt - 1, backoff_delays);
                    }
                    trace!(query = text, attempt, "sending geocode request");
                    let outcome = match timeout(self.request_timeout, self.service.lookup(text)).await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ServiceError::Transient(format!(
                            "no response within {:?}",
                            self.request_timeout
                        ))),
                    };
                    match outcome {
                        Ok(Some(coordinates)) => {
                            return ClientResponse::finished(
                                GeocodeStatus::Ok,
                                Some(coordinates),
                                attempt,
                                backoff_delays,
                            )
                        }
                        Ok(None) => {
                            return ClientResponse::finished(
                                GeocodeStatus::NotFound,
                                None,
                                attempt,
                                backoff_delays,
                            )
                        }
                        Err(err) => self.policy.after_failure(attempt, err),
                    }
                }
                RetryState::BackingOff { attempt, delay } => {
                    if stop.load(Ordering::SeqCst) {
                        return ClientResponse::stopped(attempt, backoff_delays);
                    }
                    let delay = delay + self.jitter(attempt);
                    warn!(
                        query = text,
                        attempt, "geocode request failed; retrying after {:?}", delay
                    );
                    backoff_delays.push(delay);
                    sleep(delay).await;
                    RetryState::Attempting {
                        attempt: attempt + 1,
                    }
                }
                RetryState::Exhausted {
                    attempts,
                    last_error,
                } => {
                    warn!(
                        query = text,
                        attempts,
                        error = %last_error,
                        "giving up on geocode request"
                    );
                    return ClientResponse {
                        status: GeocodeStatus::Error,
                        coordinates: None,
                        attempts,
                        backoff_delays,
                        error: Some(last_error),
                        cancelled: false,
                    };
                }
            };
        }
    }

    /// Random extra delay in `[0, base)`. Past the exponent cap the base delay stops
    /// growing, so the jitter is pinned to the top of its range to keep delays monotonic.
    fn jitter(&self, attempt: u32) -> Duration {
        let base_ms = self.policy.base_delay.as_millis() as u64;
        if !self.policy.jitter || base_ms == 0 {
            return Duration::ZERO;
        }
        if attempt > MAX_BACKOFF_EXPONENT + 1 {
            return Duration::from_millis(base_ms - 1);
        }
        let mut rng = self.jitter_rng.lock();
        Duration::from_millis(rng.gen_range(0..base_ms))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Found(f64, f64),
        NotFound,
        Transient,
        Permanent,
        /// Never answers within any sane timeout.
        Hang,
        /// Answers with a match after the given delay.
        Slow(Duration, f64, f64),
        /// Answers with no match after the given delay.
        SlowMiss(Duration),
    }

    /// In-process geocoder with per-query scripted answers. Unscripted queries get no match.
    #[derive(Default)]
    pub struct ScriptedService {
        script: Mutex<HashMap<String, VecDeque<Scripted>>>,
        fallback: Mutex<HashMap<String, Scripted>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedService {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queues one answer per call, in order. Once drained, the last answer repeats.
        pub fn script(&self, query: &str, answers: Vec<Scripted>) {
            if let Some(last) = answers.last() {
                self.fallback.lock().insert(query.to_string(), last.clone());
            }
            self.script
                .lock()
                .insert(query.to_string(), answers.into_iter().collect());
        }

        pub fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        pub fn calls_for(&self, query: &str) -> usize {
            self.calls.lock().iter().filter(|(q, _)| q == query).count()
        }

        fn next_answer(&self, query: &str) -> Scripted {
            let queued = self
                .script
                .lock()
                .get_mut(query)
                .and_then(|answers| answers.pop_front());
            queued
                .or_else(|| self.fallback.lock().get(query).cloned())
                .unwrap_or(Scripted::NotFound)
        }
    }

    #[async_trait]
    impl GeocodeService for ScriptedService {
        async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, ServiceError> {
            self.calls.lock().push((query.to_string(), Instant::now()));
            match self.next_answer(query) {
                Scripted::Found(latitude, longitude) => Ok(Some(Coordinates {
                    latitude,
                    longitude,
                })),
                Scripted::NotFound => Ok(None),
                Scripted::Transient => Err(ServiceError::Transient("503".into())),
                Scripted::Permanent => Err(ServiceError::Permanent("400".into())),
                Scripted::Hang => {
                    sleep(Duration::from_secs(3_600)).await;
                    Err(ServiceError::Transient("hung".into()))
                }
                Scripted::Slow(delay, latitude, longitude) => {
                    sleep(delay).await;
                    Ok(Some(Coordinates {
                        latitude,
                        longitude,
                    }))
                }
                Scripted::SlowMiss(delay) => {
                    sleep(delay).await;
                    Ok(None)
                }
            }
        }
    }
}
