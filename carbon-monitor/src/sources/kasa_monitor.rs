use std::net::{IpAddr, SocketAddr};

use serde::Deserialize;
use serde_json::Value;

use super::kasa_protocol::{realtime_request, sysinfo_request, NetworkTransport, PlugTransport};
use super::{DeviceSampleSet, MeteringSource, MonitorOptions};
use crate::carbon::CarbonBinding;
use crate::error::{ConfigError, RemoteAccessError};

/// Smart plugs and power strips found by local-network discovery.
pub struct KasaMonitor {
    transport: Box<dyn PlugTransport>,
    devices: Vec<IpAddr>,
    carbon: CarbonBinding,
}

#[derive(Debug, Clone, Deserialize)]
struct SysInfo {
    alias: String,
    #[serde(default)]
    feature: String,
    #[serde(default, rename = "deviceId")]
    device_id: String,
    #[serde(default)]
    children: Vec<Outlet>,
}

#[derive(Debug, Clone, Deserialize)]
struct Outlet {
    id: String,
    alias: String,
}

impl SysInfo {
    fn has_emeter(&self) -> bool {
        self.feature.split(':').any(|f| f == "ENE")
    }

    /// Older strips report a two-digit outlet index instead of a full id.
    fn child_id(&self, outlet: &Outlet) -> String {
        if outlet.id.len() <= 2 {
            format!("{}{}", self.device_id, outlet.id)
        } else {
            outlet.id.clone()
        }
    }
}

fn module_reply<'a>(reply: &'a Value, module: &str, method: &str, host: IpAddr) -> Result<&'a Value, RemoteAccessError> {
    let endpoint = || format!("kasa device {host}");
    let body = reply
        .get(module)
        .and_then(|m| m.get(method))
        .ok_or_else(|| RemoteAccessError::malformed(endpoint(), format!("missing {module}.{method}")))?;

    match body.get("err_code").and_then(Value::as_i64) {
        None | Some(0) => Ok(body),
        Some(code) => Err(RemoteAccessError::malformed(
            endpoint(),
            format!("{module}.{method} err_code {code}: {}", body.get("err_msg").and_then(Value::as_str).unwrap_or("")),
        )),
    }
}

impl KasaMonitor {
    pub fn new(options: &MonitorOptions) -> Result<Self, ConfigError> {
        let target: SocketAddr = options
            .discovery_target
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("invalid kasa discovery target: {e}")))?;
        let carbon = options.carbon_binding()?;
        Ok(Self::with_transport(
            carbon,
            NetworkTransport::new(target, options.discovery_timeout),
        ))
    }

    pub fn with_transport(carbon: CarbonBinding, transport: impl PlugTransport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            devices: Vec::new(),
            carbon,
        }
    }

    pub fn devices(&self) -> &[IpAddr] {
        &self.devices
    }

    async fn sysinfo(&self, host: IpAddr) -> Result<SysInfo, RemoteAccessError> {
        let reply = self.transport.query(host, &sysinfo_request()).await?;
        let body = module_reply(&reply, "system", "get_sysinfo", host)?;
        serde_json::from_value(body.clone()).map_err(|e| RemoteAccessError::malformed(format!("kasa device {host}"), e))
    }

    /// Watts from a realtime reading; newer firmware reports `power_mw`.
    async fn realtime_power(&self, host: IpAddr, child_id: Option<&str>) -> Result<f64, RemoteAccessError> {
        let reply = self.transport.query(host, &realtime_request(child_id)).await?;
        let body = module_reply(&reply, "emeter", "get_realtime", host)?;

        if let Some(w) = body.get("power").and_then(Value::as_f64) {
            return Ok(w);
        }
        body.get("power_mw")
            .and_then(Value::as_f64)
            .map(|mw| mw / 1000.0)
            .ok_or_else(|| RemoteAccessError::malformed(format!("kasa device {host}"), "realtime reading has no power"))
    }
}

#[async_trait::async_trait]
impl MeteringSource for KasaMonitor {
    async fn discover_devices(&mut self) -> Result<(), RemoteAccessError> {
        self.devices = self.transport.discover().await?;
        Ok(())
    }

    async fn sample_once(&mut self) -> Result<DeviceSampleSet, RemoteAccessError> {
        if self.devices.is_empty() {
            self.discover_devices().await?;
        }

        let mut values = DeviceSampleSet::new();
        for host in self.devices.clone() {
            let info = self.sysinfo(host).await?;
            if !info.has_emeter() {
                tracing::debug!(%host, alias = %info.alias, "skipping device without energy meter");
                continue;
            }

            if info.children.is_empty() {
                let watts = self.realtime_power(host, None).await?;
                values.insert(info.alias.clone(), watts);
            } else {
                for outlet in &info.children {
                    let child_id = info.child_id(outlet);
                    let watts = self.realtime_power(host, Some(&child_id)).await?;
                    values.insert(format!("{}-{}", info.alias, outlet.alias), watts);
                }
            }
        }

        Ok(values)
    }

    fn carbon(&self) -> &CarbonBinding {
        &self.carbon
    }
}
