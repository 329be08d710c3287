use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::trace;

use crate::client::{Coordinates, GeocodeService};
use crate::config::GeocoderConfig;
use crate::errors::{AppResult, ServiceError};

/// Free-form search against a Nominatim-compatible `/search` endpoint.
pub struct NominatimClient {
    http: Client,
    endpoint: String,
}

impl NominatimClient {
    pub fn new(config: &GeocoderConfig) -> AppResult<Self> {
        Self::with_endpoint(
            &config.endpoint,
            &config.user_agent,
            config.request_timeout(),
        )
    }

    pub fn with_endpoint(endpoint: &str, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

#[derive(serde::Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

#[async_trait]
impl GeocodeService for NominatimClient {
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, ServiceError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|err| ServiceError::Transient(format!("unreadable response: {err}")))?;
        trace!(query, hits = hits.len(), "geocoder responded");

        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        let latitude = parse_coordinate(&hit.lat)?;
        let longitude = parse_coordinate(&hit.lon)?;
        Ok(Some(Coordinates {
            latitude,
            longitude,
        }))
    }
}

fn classify_transport(err: reqwest::Error) -> ServiceError {
    if err.is_builder() {
        ServiceError::Permanent(err.to_string())
    } else {
        ServiceError::Transient(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> ServiceError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ServiceError::Transient(format!("service responded {status}"))
    } else {
        ServiceError::Permanent(format!("service rejected query: {status}"))
    }
}

fn parse_coordinate(raw: &str) -> Result<f64, ServiceError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| ServiceError::Permanent(format!("invalid coordinate {raw:?}")))
}
