//! Metering sources: where power-draw samples come from.

pub mod kasa_monitor;
pub mod kasa_protocol;
pub mod omada_auth;
pub mod omada_monitor;

use std::{collections::BTreeMap, time::Duration};

use crate::carbon::{self, CarbonBinding, CarbonSettings, Location, DEFAULT_PROVIDER};
use crate::error::{ConfigError, RemoteAccessError};

pub use kasa_monitor::KasaMonitor;
pub use omada_auth::{OmadaSettings, TokenManager, TokenState};
pub use omada_monitor::OmadaMonitor;

/// Device identifier -> instantaneous draw in watts, for one tick.
pub type DeviceSampleSet = BTreeMap<String, f64>;

#[async_trait::async_trait]
pub trait MeteringSource: Send + Sync {
    /// Populate or replace the device set.
    async fn discover_devices(&mut self) -> Result<(), RemoteAccessError>;

    /// Read current power draw for every metered device.
    async fn sample_once(&mut self) -> Result<DeviceSampleSet, RemoteAccessError>;

    /// The carbon-intensity lookup this source's devices are attributed to.
    fn carbon(&self) -> &CarbonBinding;
}

/// Constructor inputs shared by every metering source.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub grid_id: Option<String>,
    pub co2_api_provider: String,
    pub carbon: CarbonSettings,
    pub discovery_target: String,
    pub discovery_timeout: Duration,
    pub omada: Option<OmadaSettings>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            lat: None,
            lon: None,
            grid_id: None,
            co2_api_provider: DEFAULT_PROVIDER.to_string(),
            carbon: CarbonSettings::default(),
            discovery_target: kasa_protocol::DEFAULT_DISCOVERY_TARGET.to_string(),
            discovery_timeout: Duration::from_secs(3),
            omada: None,
        }
    }
}

impl MonitorOptions {
    /// Validate the location, then build the named provider.
    ///
    /// The provider name is checked before the cache file is touched.
    pub fn carbon_binding(&self) -> Result<CarbonBinding, ConfigError> {
        let location = Location::from_parts(self.lat, self.lon, self.grid_id.clone())?;
        let provider = carbon::provider_for(&self.co2_api_provider, &self.carbon)?;
        Ok(CarbonBinding::new(location, provider))
    }
}

/// The configured metering source.
pub enum Monitor {
    Kasa(KasaMonitor),
    Omada(OmadaMonitor),
}

/// Select a metering source by its discriminator (`"kasa"` or `"omada"`).
pub fn create_monitor(device_type: &str, options: &MonitorOptions) -> Result<Monitor, ConfigError> {
    match device_type {
        "kasa" => Ok(Monitor::Kasa(KasaMonitor::new(options)?)),
        "omada" => Ok(Monitor::Omada(OmadaMonitor::new(options)?)),
        other => Err(ConfigError::UnknownDeviceType(other.to_string())),
    }
}

#[async_trait::async_trait]
impl MeteringSource for Monitor {
    async fn discover_devices(&mut self) -> Result<(), RemoteAccessError> {
        match self {
            Self::Kasa(m) => m.discover_devices().await,
            Self::Omada(m) => m.discover_devices().await,
        }
    }

    async fn sample_once(&mut self) -> Result<DeviceSampleSet, RemoteAccessError> {
        match self {
            Self::Kasa(m) => m.sample_once().await,
            Self::Omada(m) => m.sample_once().await,
        }
    }

    fn carbon(&self) -> &CarbonBinding {
        match self {
            Self::Kasa(m) => m.carbon(),
            Self::Omada(m) => m.carbon(),
        }
    }
}
