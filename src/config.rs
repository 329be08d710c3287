use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

use crate::client::RetryPolicy;
use crate::errors::{AppError, AppResult};

pub const ENV_USER_AGENT: &str = "GEOCODER_USER_AGENT";
pub const ENV_CACHE_PATH: &str = "GEOCODER_CACHE_PATH";
pub const ENV_RATE_LIMIT_SECONDS: &str = "GEOCODER_RATE_LIMIT_SECONDS";
pub const ENV_MAX_RETRIES: &str = "GEOCODER_MAX_RETRIES";
pub const ENV_CONCURRENCY: &str = "GEOCODER_CONCURRENCY";
pub const ENV_LOG_LEVEL: &str = "GEOCODER_LOG_LEVEL";
pub const ENV_LOG_FILE: &str = "GEOCODER_LOG_FILE";
pub const ENV_ENDPOINT: &str = "GEOCODER_ENDPOINT";
pub const ENV_POSTCODE_SUFFIX: &str = "GEOCODER_POSTCODE_SUFFIX";
pub const ENV_BASE_BACKOFF_MS: &str = "GEOCODER_BASE_BACKOFF_MS";
pub const ENV_BACKOFF_JITTER: &str = "GEOCODER_BACKOFF_JITTER";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "GEOCODER_REQUEST_TIMEOUT_SECS";
pub const ENV_FLUSH_INTERVAL_SECS: &str = "GEOCODER_FLUSH_INTERVAL_SECS";

const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_POSTCODE_SUFFIX: &str = "UK";
const DEFAULT_RATE_LIMIT_SECONDS: f64 = 1.0;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(AppError::Config(format!(
                "{ENV_LOG_LEVEL}: unknown log level {value:?}"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct GeocoderConfig {
    pub user_agent: String,
    pub rate_limit_seconds: f64,
    pub max_retries: u32,
    pub cache_path: PathBuf,
    pub concurrency: usize,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
    pub endpoint: String,
    pub postcode_suffix: Option<String>,
    pub base_backoff_ms: u64,
    pub backoff_jitter: bool,
    pub request_timeout_secs: u64,
    pub flush_interval_secs: u64,
}

impl GeocoderConfig {
    pub fn from_env() -> AppResult<Self> {
        load_dotenv_if_applicable();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds and validates a configuration from an arbitrary key source.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source { lookup: &lookup };

        let user_agent = source
            .required(ENV_USER_AGENT)?
            .trim()
            .to_string();
        let cache_path = PathBuf::from(source.required(ENV_CACHE_PATH)?);

        let rate_limit_seconds =
            source.parsed(ENV_RATE_LIMIT_SECONDS, DEFAULT_RATE_LIMIT_SECONDS)?;
        if !rate_limit_seconds.is_finite() || rate_limit_seconds <= 0.0 {
            return Err(invalid(
                ENV_RATE_LIMIT_SECONDS,
                rate_limit_seconds,
                "must be a positive number of seconds",
            ));
        }

        let concurrency: usize = source.parsed(ENV_CONCURRENCY, DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(invalid(ENV_CONCURRENCY, concurrency, "must be at least 1"));
        }

        let request_timeout_secs: u64 =
            source.parsed(ENV_REQUEST_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS)?;
        if request_timeout_secs == 0 {
            return Err(invalid(
                ENV_REQUEST_TIMEOUT_SECS,
                request_timeout_secs,
                "must be at least 1",
            ));
        }

        let postcode_suffix = match source.optional(ENV_POSTCODE_SUFFIX) {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value.trim().to_string()),
            None => Some(DEFAULT_POSTCODE_SUFFIX.to_string()),
        };

        Ok(Self {
            user_agent,
            rate_limit_seconds,
            max_retries: source.parsed(ENV_MAX_RETRIES, DEFAULT_MAX_RETRIES)?,
            cache_path,
            concurrency,
            log_level: source.parsed(ENV_LOG_LEVEL, LogLevel::Info)?,
            log_file: source.optional(ENV_LOG_FILE).map(PathBuf::from),
            endpoint: source
                .optional(ENV_ENDPOINT)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            postcode_suffix,
            base_backoff_ms: source.parsed(ENV_BASE_BACKOFF_MS, DEFAULT_BASE_BACKOFF_MS)?,
            backoff_jitter: source.flag(ENV_BACKOFF_JITTER, true)?,
            request_timeout_secs,
            flush_interval_secs: source.parsed(ENV_FLUSH_INTERVAL_SECS, 0)?,
        })
    }

    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_secs > 0).then(|| Duration::from_secs(self.flush_interval_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_backoff_ms),
            self.backoff_jitter,
        )
    }
}

struct Source<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Source<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn required(&self, key: &str) -> AppResult<String> {
        match self.optional(key) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(AppError::Config(format!(
                "missing required option {key}"
            ))),
        }
    }

    fn parsed<T>(&self, key: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(key) {
            Some(value) if !value.trim().is_empty() => value.trim().parse::<T>().map_err(|err| {
                AppError::Config(format!("{key}: cannot parse {value:?}: {err}"))
            }),
            _ => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> AppResult<bool> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => match value.trim() {
                "" => Ok(default),
                "1" | "true" | "TRUE" | "True" | "yes" => Ok(true),
                "0" | "false" | "FALSE" | "False" | "no" => Ok(false),
                other => Err(AppError::Config(format!(
                    "{key}: expected a boolean, got {other:?}"
                ))),
            },
        }
    }
}

fn invalid(key: &str, value: impl fmt::Display, reason: &str) -> AppError {
    AppError::Config(format!("{key}={value} {reason}"))
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions)
        || env::var("ALLOW_DOTENV")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn test_config(cache_path: impl Into<PathBuf>) -> GeocoderConfig {
    GeocoderConfig {
        user_agent: "batch-geocoder-tests".into(),
        rate_limit_seconds: 1.0,
        max_retries: 3,
        cache_path: cache_path.into(),
        concurrency: 4,
        log_level: LogLevel::Debug,
        log_file: None,
        endpoint: DEFAULT_ENDPOINT.into(),
        postcode_suffix: Some(DEFAULT_POSTCODE_SUFFIX.into()),
        base_backoff_ms: 1_000,
        backoff_jitter: false,
        request_timeout_secs: 5,
        flush_interval_secs: 0,
    }
}
