use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::carbon::{CarbonSettings, DEFAULT_PROVIDER, ELECTRICITY_MAPS_LATEST_URL};
use crate::error::ConfigError;
use crate::sinks::FileMode;
use crate::sources::{kasa_protocol::DEFAULT_DISCOVERY_TARGET, MonitorOptions, OmadaSettings};
use usage_client::ColumnSelector;

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub device_type: String,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    pub timeout_secs: Option<u64>,
    pub status_interval_secs: Option<u64>,
    /// Columns shown by the status poller. Empty or `["*"]` means all.
    #[serde(default)]
    pub status_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationConfig {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub grid_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarbonConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub api_key: Option<String>,
    #[serde(default = "default_carbon_base_url")]
    pub base_url: String,
    #[serde(default = "default_cache_expiry_mins")]
    pub cache_expiry_mins: u64,
    #[serde(default = "default_staleness_threshold_mins")]
    pub staleness_threshold_mins: u64,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default)]
    pub clear_cache: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CarbonConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            base_url: default_carbon_base_url(),
            cache_expiry_mins: default_cache_expiry_mins(),
            staleness_threshold_mins: default_staleness_threshold_mins(),
            cache_path: default_cache_path(),
            clear_cache: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OmadaConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub omadac_id: String,
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KasaConfig {
    #[serde(default = "default_discovery_target")]
    pub discovery_target: String,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
}

impl Default for KasaConfig {
    fn default() -> Self {
        Self {
            discovery_target: default_discovery_target(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Postgres,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,
    #[serde(default)]
    pub file_mode: FileMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

/// `[logging]`: filter directives in `EnvFilter` syntax. `RUST_LOG` wins when set.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directives")]
    pub directives: String,
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directives: default_log_directives(),
            with_target: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub carbon: CarbonConfig,
    pub omada: Option<OmadaConfig>,
    #[serde(default)]
    pub kasa: KasaConfig,
    pub storage: StorageConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("CARBON_MONITOR_CONFIG").unwrap_or_else(|_| "carbon-monitor.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        Ok(cfg)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.monitor.delay_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.monitor.timeout_secs.map(Duration::from_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.status_interval_secs.unwrap_or(self.monitor.delay_secs).max(1))
    }

    /// Constructor inputs for whichever metering source `monitor.device_type` names.
    pub fn status_columns(&self) -> Result<ColumnSelector, ConfigError> {
        ColumnSelector::from_names(&self.monitor.status_columns)
            .map_err(|e| ConfigError::Invalid(format!("monitor.status_columns: {e}")))
    }

    pub fn monitor_options(&self) -> Result<MonitorOptions, ConfigError> {
        let carbon = &self.carbon;
        let omada = match (&self.omada, self.monitor.device_type.as_str()) {
            (Some(o), _) => Some(OmadaSettings {
                base_url: o.base_url.clone(),
                client_id: o.client_id.clone(),
                client_secret: o.client_secret.clone(),
                omadac_id: o.omadac_id.clone(),
                accept_invalid_certs: o.accept_invalid_certs,
                request_timeout: Duration::from_secs(o.request_timeout_secs),
            }),
            (None, "omada") => return Err(ConfigError::Missing("[omada] section")),
            (None, _) => None,
        };

        Ok(MonitorOptions {
            lat: self.location.lat,
            lon: self.location.lon,
            grid_id: self.location.grid_id.clone(),
            co2_api_provider: carbon.provider.clone(),
            carbon: CarbonSettings {
                api_key: carbon.api_key.clone(),
                base_url: carbon.base_url.clone(),
                cache_expiry: Duration::from_secs(carbon.cache_expiry_mins * 60),
                staleness_threshold: Duration::from_secs(carbon.staleness_threshold_mins * 60),
                cache_path: carbon.cache_path.clone(),
                clear_cache: carbon.clear_cache,
                request_timeout: Duration::from_secs(carbon.request_timeout_secs),
            },
            discovery_target: self.kasa.discovery_target.clone(),
            discovery_timeout: Duration::from_millis(self.kasa.discovery_timeout_ms),
            omada,
        })
    }
}

fn default_delay_secs() -> u64 {
    15
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_carbon_base_url() -> String {
    ELECTRICITY_MAPS_LATEST_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_cache_expiry_mins() -> u64 {
    30
}

fn default_staleness_threshold_mins() -> u64 {
    120
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("em_cache.json")
}

fn default_true() -> bool {
    true
}

fn default_discovery_target() -> String {
    DEFAULT_DISCOVERY_TARGET.to_string()
}

fn default_discovery_timeout_ms() -> u64 {
    3000
}

fn default_max_connections() -> u32 {
    4
}

fn default_file_path() -> PathBuf {
    PathBuf::from("energy_usage.csv")
}

fn default_log_directives() -> String {
    "carbon_monitor=info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use usage_client::Column;

    #[test]
    fn minimal_file_config_fills_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [monitor]
            device_type = "kasa"

            [location]
            grid_id = "DE"

            [storage]
            kind = "file"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.delay(), Duration::from_secs(15));
        assert_eq!(cfg.timeout(), None);
        assert_eq!(cfg.status_interval(), Duration::from_secs(15));
        assert_eq!(cfg.storage.kind, StorageKind::File);
        assert_eq!(cfg.storage.file_mode, FileMode::Append);
        assert_eq!(cfg.carbon.provider, "ElectricityMaps");

        let opts = cfg.monitor_options().unwrap();
        assert_eq!(opts.grid_id.as_deref(), Some("DE"));
        assert_eq!(opts.carbon.cache_expiry, Duration::from_secs(30 * 60));
        assert_eq!(opts.carbon.staleness_threshold, Duration::from_secs(120 * 60));
        assert!(opts.omada.is_none());
        assert_eq!(cfg.status_columns().unwrap(), ColumnSelector::All);
        assert_eq!(cfg.logging.directives, "carbon_monitor=info");
        assert!(!cfg.logging.with_target);
    }

    #[test]
    fn omada_device_type_requires_omada_section() {
        let cfg = AppConfig::from_toml(
            r#"
            [monitor]
            device_type = "omada"
            delay_secs = 5
            timeout_secs = 60

            [location]
            lat = 40.7128
            lon = -74.006

            [storage]
            kind = "postgres"
            uri = "postgres://localhost/energy"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(cfg.monitor_options().unwrap_err(), ConfigError::Missing("[omada] section"));
    }

    #[test]
    fn omada_section_is_carried_into_options() {
        let cfg = AppConfig::from_toml(
            r#"
            [monitor]
            device_type = "omada"

            [location]
            grid_id = "US-CAL-CISO"

            [carbon]
            api_key = "em-key"
            cache_expiry_mins = 5

            [omada]
            base_url = "https://controller.local:8043"
            client_id = "cid"
            client_secret = "secret"
            omadac_id = "abc123"

            [storage]
            kind = "file"
            file_mode = "overwrite"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.storage.file_mode, FileMode::Overwrite);
        let opts = cfg.monitor_options().unwrap();
        let omada = opts.omada.unwrap();
        assert_eq!(omada.omadac_id, "abc123");
        assert!(omada.accept_invalid_certs);
        assert_eq!(omada.request_timeout, Duration::from_secs(10));
        assert_eq!(opts.carbon.api_key.as_deref(), Some("em-key"));
        assert_eq!(opts.carbon.cache_expiry, Duration::from_secs(300));
    }

    #[test]
    fn status_columns_and_logging_are_read_from_the_file() {
        let cfg = AppConfig::from_toml(
            r#"
            [monitor]
            device_type = "kasa"
            status_columns = ["device", "power_draw_watts"]

            [location]
            grid_id = "DE"

            [storage]
            kind = "file"

            [logging]
            directives = "carbon_monitor=debug,sqlx=warn"
            with_target = true
            "#,
        )
        .unwrap();

        assert_eq!(
            cfg.status_columns().unwrap(),
            ColumnSelector::Only(vec![Column::Device, Column::PowerDrawWatts])
        );
        assert_eq!(cfg.logging.directives, "carbon_monitor=debug,sqlx=warn");
        assert!(cfg.logging.with_target);
    }

    #[test]
    fn unknown_status_column_is_a_config_error() {
        let cfg = AppConfig::from_toml(
            r#"
            [monitor]
            device_type = "kasa"
            status_columns = ["device", "voltage"]

            [location]
            grid_id = "DE"

            [storage]
            kind = "file"
            "#,
        )
        .unwrap();

        assert!(matches!(cfg.status_columns(), Err(ConfigError::Invalid(msg)) if msg.contains("voltage")));
    }
}
