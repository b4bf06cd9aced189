use serde::Deserialize;

use super::omada_auth::{is_unauthorized, read_result, TokenManager};
use super::{DeviceSampleSet, MeteringSource, MonitorOptions};
use crate::carbon::CarbonBinding;
use crate::error::{ConfigError, RemoteAccessError};

const POE_ENDPOINT: &str = "omada poe usage";

/// PoE ports on the switches of one Omada site.
pub struct OmadaMonitor {
    auth: TokenManager,
    carbon: CarbonBinding,
}

/// One switch in the dashboard PoE report.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPoeUsage {
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub poe_ports: Vec<PoePort>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoePort {
    pub port_id: u32,
    #[serde(default)]
    pub poe_enabled: bool,
    #[serde(default)]
    pub poe_power: Option<f64>,
}

/// Port id -> watts for every port with PoE switched on. Ports without a
/// reading count as zero.
pub fn parse_poe_usage(switches: &[SwitchPoeUsage]) -> DeviceSampleSet {
    switches
        .iter()
        .flat_map(|switch| switch.poe_ports.iter())
        .filter(|port| port.poe_enabled)
        .map(|port| (port.port_id.to_string(), port.poe_power.unwrap_or(0.0)))
        .collect()
}

impl OmadaMonitor {
    pub fn new(options: &MonitorOptions) -> Result<Self, ConfigError> {
        let settings = options
            .omada
            .clone()
            .ok_or(ConfigError::Missing("omada controller settings"))?;
        let carbon = options.carbon_binding()?;
        let auth = TokenManager::new(settings)?;
        Ok(Self { auth, carbon })
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.auth
    }
}

#[async_trait::async_trait]
impl MeteringSource for OmadaMonitor {
    /// Ports are reported per site on every poll, so there is nothing to
    /// enumerate up front.
    async fn discover_devices(&mut self) -> Result<(), RemoteAccessError> {
        Ok(())
    }

    async fn sample_once(&mut self) -> Result<DeviceSampleSet, RemoteAccessError> {
        let headers = self.auth.get_headers().await?;
        let site_id = self.auth.get_site_id().await?;
        let url = self
            .auth
            .settings()
            .api_url(&format!("/sites/{site_id}/dashboard/poe-usage"));

        let resp = self.auth.http().get(url).headers(headers).send().await?;
        let switches: Vec<SwitchPoeUsage> = match read_result(resp, POE_ENDPOINT).await {
            Ok(switches) => switches,
            Err(e) => {
                if is_unauthorized(&e) {
                    tracing::warn!("omada controller rejected the access token, refreshing on next poll");
                    self.auth.invalidate_access_token();
                }
                return Err(e);
            }
        };

        let values = parse_poe_usage(&switches);
        tracing::debug!(switches = switches.len(), ports = values.len(), "read omada poe usage");
        Ok(values)
    }

    fn carbon(&self) -> &CarbonBinding {
        &self.carbon
    }
}
