use std::time::Duration;

use time::OffsetDateTime;
use usage_client::EnergyUsageRecord;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SampleRejected {
    #[error("power draw for '{device}' must be a finite non-negative number, got {watts}")]
    InvalidPower { device: String, watts: f64 },
}

/// Emission attributed to one sampling interval.
///
/// `mg = hours * kW * intensity / 1000`, kept exactly as every stored record
/// has been computed so existing series stay comparable. No intensity means
/// no emission figure.
pub fn emitted_mg_co2e(delay: Duration, watts: f64, intensity_g_per_kwh: Option<f64>) -> Option<f64> {
    let intensity = intensity_g_per_kwh?;
    let hours = delay.as_secs_f64() / 3600.0;
    let kilowatts = watts / 1000.0;
    Some(hours * kilowatts * intensity / 1000.0)
}

/// Build the record for one device in one tick.
pub fn build_record(
    device: String,
    timestamp: OffsetDateTime,
    watts: f64,
    delay: Duration,
    intensity_g_per_kwh: Option<f64>,
) -> Result<EnergyUsageRecord, SampleRejected> {
    if !watts.is_finite() || watts < 0.0 {
        metrics::counter!("samples_rejected_total").increment(1);
        return Err(SampleRejected::InvalidPower { device, watts });
    }

    Ok(EnergyUsageRecord {
        device,
        timestamp,
        power_draw_watts: watts,
        avg_emitted_mg_co2e: emitted_mg_co2e(delay, watts, intensity_g_per_kwh),
        grid_carbon_intensity_g_per_kwh: intensity_g_per_kwh,
    })
}
