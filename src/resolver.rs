use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{QueryKey, ResultCache};
use crate::client::{GeocodeResult, RateLimitedClient, ResultSource};
use crate::ingestion::AddressRecord;
use crate::postcode::extract_postcode;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub result: GeocodeResult,
    /// Attempts sent to the external service while resolving this record.
    pub external_calls: u32,
}

/// Postcode first, full address second. A postcode match wins even though it is coarser.
pub struct FallbackResolver {
    client: RateLimitedClient,
    cache: Arc<ResultCache>,
    postcode_suffix: Option<String>,
}

impl FallbackResolver {
    pub fn new(
        client: RateLimitedClient,
        cache: Arc<ResultCache>,
        postcode_suffix: Option<String>,
    ) -> Self {
        Self {
            client,
            cache,
            postcode_suffix,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub async fn resolve(&self, record: &AddressRecord) -> Resolution {
        self.resolve_until(record, &AtomicBool::new(false)).await
    }

    /// Resolves `record` but issues no new request once `stop` is set. A record cut short
    /// this way comes back as skipped and leaves nothing in the cache.
    pub async fn resolve_until(&self, record: &AddressRecord, stop: &AtomicBool) -> Resolution {
        let address = record.raw_address.trim();
        if address.is_empty() {
            warn!(id = %record.id, "blank address; not sent to the geocoder");
            return Resolution {
                result: GeocodeResult::error(ResultSource::Address),
                external_calls: 0,
            };
        }

        let mut external_calls = 0;
        if let Some(postcode) = extract_postcode(address) {
            let (result, calls) = self
                .lookup(
                    QueryKey::normalize(postcode),
                    self.postcode_query(postcode),
                    ResultSource::Postcode,
                    stop,
                )
                .await;
            external_calls += calls;
            if result.is_ok() || result.source == ResultSource::Skipped {
                return Resolution {
                    result,
                    external_calls,
                };
            }
            debug!(
                id = %record.id,
                postcode,
                status = result.status.as_str(),
                "postcode lookup missed; trying full address"
            );
            if stop.load(Ordering::SeqCst) {
                debug!(id = %record.id, "stop requested; address fallback skipped");
                return Resolution {
                    result: GeocodeResult::skipped(),
                    external_calls,
                };
            }
        }

        let (result, calls) = self
            .lookup(
                QueryKey::normalize(address),
                address.to_string(),
                ResultSource::Address,
                stop,
            )
            .await;
        Resolution {
            result,
            external_calls: external_calls + calls,
        }
    }

    async fn lookup(
        &self,
        key: QueryKey,
        query: String,
        source: ResultSource,
        stop: &AtomicBool,
    ) -> (GeocodeResult, u32) {
        let _claim = self.cache.claim(&key).await;
        if let Some(cached) = self.cache.get_definitive(&key) {
            debug!(key = %key, status = cached.status.as_str(), "served from cache");
            return (cached.with_source(ResultSource::Cache), 0);
        }

        let response = self.client.query_until(&query, stop).await;
        let result = GeocodeResult::from_response(&response, source);
        if !response.cancelled {
            self.cache.put(key, result.clone());
        }
        (result, response.attempts)
    }

    fn postcode_query(&self, postcode: &str) -> String {
        match &self.postcode_suffix {
            Some(suffix) => format!("{postcode}, {suffix}"),
            None => postcode.to_string(),
        }
    }
}
