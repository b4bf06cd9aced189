//! Grid carbon intensity lookup.
//!
//! A [`CarbonIntensityProvider`] answers "how many gCO2e per kWh right now"
//! for a [`Location`]. `None` means no usable reading (stale or absent data).

pub mod cache;
pub mod electricity_maps;

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::error::{ConfigError, RemoteAccessError};

pub use cache::{CarbonCache, CarbonCacheEntry};
pub use electricity_maps::ElectricityMapsProvider;

pub const DEFAULT_PROVIDER: &str = "ElectricityMaps";
pub const ELECTRICITY_MAPS_LATEST_URL: &str =
    "https://api-access.electricitymaps.com/free-tier/carbon-intensity/latest";

/// Where the monitored devices draw their power from: a grid zone or a point.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Grid(String),
    Coordinates { lat: f64, lon: f64 },
}

impl Location {
    /// A grid id takes precedence when both forms are supplied.
    pub fn from_parts(lat: Option<f64>, lon: Option<f64>, grid_id: Option<String>) -> Result<Self, ConfigError> {
        match (grid_id, lat, lon) {
            (Some(grid), _, _) => Ok(Location::Grid(grid)),
            (None, Some(lat), Some(lon)) => Ok(Location::Coordinates { lat, lon }),
            _ => Err(ConfigError::MissingLocation),
        }
    }

    pub fn grid_id(&self) -> Option<&str> {
        match self {
            Location::Grid(g) => Some(g),
            Location::Coordinates { .. } => None,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match self {
            Location::Grid(_) => None,
            Location::Coordinates { lat, lon } => Some((*lat, *lon)),
        }
    }

    /// Parameter values joined with `_`, in request order.
    pub fn cache_key(&self) -> String {
        self.query_params()
            .into_iter()
            .map(|(_, v)| v)
            .collect::<Vec<_>>()
            .join("_")
    }

    pub(crate) fn query_params(&self) -> Vec<(&'static str, String)> {
        match self {
            Location::Grid(g) => vec![("zone", g.clone())],
            Location::Coordinates { lat, lon } => vec![("lat", lat.to_string()), ("lon", lon.to_string())],
        }
    }
}

#[async_trait::async_trait]
pub trait CarbonIntensityProvider: Send + Sync {
    async fn get(&self, location: &Location) -> Result<Option<f64>, RemoteAccessError>;
}

#[derive(Debug, Clone)]
pub struct CarbonSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Cache TTL.
    pub cache_expiry: Duration,
    /// Maximum gap between now and the provider's `updatedAt`.
    pub staleness_threshold: Duration,
    pub cache_path: PathBuf,
    pub clear_cache: bool,
    /// Upper bound on one API request.
    pub request_timeout: Duration,
}

impl Default for CarbonSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: ELECTRICITY_MAPS_LATEST_URL.to_string(),
            cache_expiry: Duration::from_secs(30 * 60),
            staleness_threshold: Duration::from_secs(120 * 60),
            cache_path: PathBuf::from("em_cache.json"),
            clear_cache: false,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Reject unknown provider names without touching the network or disk.
pub fn check_provider_name(name: &str) -> Result<(), ConfigError> {
    if name == DEFAULT_PROVIDER {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedProvider(name.to_string()))
    }
}

pub fn provider_for(name: &str, settings: &CarbonSettings) -> Result<Arc<dyn CarbonIntensityProvider>, ConfigError> {
    check_provider_name(name)?;
    Ok(Arc::new(ElectricityMapsProvider::new(settings)?))
}

/// A provider paired with the location it should be asked about.
#[derive(Clone)]
pub struct CarbonBinding {
    location: Location,
    provider: Arc<dyn CarbonIntensityProvider>,
}

impl CarbonBinding {
    pub fn new(location: Location, provider: Arc<dyn CarbonIntensityProvider>) -> Self {
        Self { location, provider }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub async fn current_intensity(&self) -> Result<Option<f64>, RemoteAccessError> {
        self.provider.get(&self.location).await
    }
}

impl std::fmt::Debug for CarbonBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarbonBinding").field("location", &self.location).finish()
    }
}
