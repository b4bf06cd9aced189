use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::{CarbonCache, CarbonIntensityProvider, CarbonSettings, Location};
use crate::error::{ConfigError, RemoteAccessError};

const ENDPOINT: &str = "electricitymaps latest carbon intensity";

/// Client for the ElectricityMaps "latest carbon intensity" endpoint, with a
/// TTL cache persisted to disk.
///
/// The cache is read-modify-write per key with no cross-request exclusion:
/// two concurrent misses for the same key both fetch, and the last write wins.
pub struct ElectricityMapsProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache_expiry: Duration,
    staleness_threshold: Duration,
    cache: Mutex<CarbonCache>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestIntensity {
    carbon_intensity: Option<f64>,
    updated_at: String,
}

impl ElectricityMapsProvider {
    pub fn new(settings: &CarbonSettings) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build http client: {e}")))?;

        let cache = if settings.clear_cache {
            let mut cache = CarbonCache::empty(&settings.cache_path);
            if let Err(e) = cache.clear() {
                tracing::warn!(error = %e, "failed to clear carbon cache file");
            }
            cache
        } else {
            CarbonCache::load(&settings.cache_path)
        };

        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            cache_expiry: settings.cache_expiry,
            staleness_threshold: settings.staleness_threshold,
            cache: Mutex::new(cache),
        })
    }

    fn cache(&self) -> MutexGuard<'_, CarbonCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch(&self, location: &Location) -> Result<LatestIntensity, RemoteAccessError> {
        metrics::counter!("carbon_api_requests_total").increment(1);

        let mut req = self.http.get(&self.base_url).query(&location.query_params());
        if let Some(key) = &self.api_key {
            req = req.header("auth-token", key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteAccessError::Status {
                endpoint: ENDPOINT.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<LatestIntensity>()
            .await
            .map_err(|e| RemoteAccessError::malformed(ENDPOINT, e))
    }

    /// The reading's intensity, or `None` when `updatedAt` is further than the
    /// staleness threshold from `now` in either direction.
    fn evaluate(&self, reading: &LatestIntensity, now: OffsetDateTime) -> Result<Option<f64>, RemoteAccessError> {
        let updated_at = OffsetDateTime::parse(&reading.updated_at, &Rfc3339)
            .map_err(|e| RemoteAccessError::malformed(ENDPOINT, format!("invalid updatedAt '{}': {e}", reading.updated_at)))?;

        if (now - updated_at).abs() > self.staleness_threshold {
            metrics::counter!("carbon_stale_readings_total").increment(1);
            tracing::warn!(updated_at = %reading.updated_at, "carbon intensity reading is stale, discarding");
            return Ok(None);
        }

        Ok(reading.carbon_intensity)
    }
}

#[async_trait::async_trait]
impl CarbonIntensityProvider for ElectricityMapsProvider {
    async fn get(&self, location: &Location) -> Result<Option<f64>, RemoteAccessError> {
        let key = location.cache_key();

        let cached = self.cache().fresh(&key, OffsetDateTime::now_utc(), self.cache_expiry);
        if let Some(entry) = cached {
            metrics::counter!("carbon_cache_hits_total").increment(1);
            return Ok(entry.value);
        }

        let reading = self.fetch(location).await?;
        let now = OffsetDateTime::now_utc();
        let value = self.evaluate(&reading, now)?;

        let mut cache = self.cache();
        cache.insert(key, value, now);
        if let Err(e) = cache.save() {
            tracing::warn!(error = %e, path = %cache.path().display(), "failed to persist carbon cache");
        }

        Ok(value)
    }
}
