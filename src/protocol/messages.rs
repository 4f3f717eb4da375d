//! Message types exchanged with the BMS firmware
//!
//! Inbound records (`data` and `status` topics) are lenient: every field is
//! optional because the firmware omits readings it could not take. The
//! outbound [`CommandRequest`] is strict and always carries all three fields.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// One telemetry record published by the BMS on the `data` topic
///
/// # Examples
/// ```
/// use bmslink::protocol::BmsTelemetry;
///
/// let record: BmsTelemetry =
///     serde_json::from_str(r#"{"pack_voltage":52.3,"soc":80}"#).unwrap();
/// assert_eq!(record.pack_voltage, Some(52.3));
/// assert_eq!(record.soc, Some(80.0));
/// assert!(record.cell_voltages.is_empty());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BmsTelemetry {
    /// Device-side timestamp (firmware uptime or epoch, device defined)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Total pack voltage in volts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_voltage: Option<f64>,
    /// Pack current in amps, negative while discharging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    /// Instantaneous power in watts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    /// State of charge in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    /// Remaining capacity in amp-hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_capacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_count: Option<f64>,
    /// First temperature probe in degrees Celsius
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature1: Option<f64>,
    /// Second temperature probe in degrees Celsius
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discharge_enabled: Option<bool>,
    /// Per-cell voltages in millivolts, in cell order; `null` reads as no cells
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cell_voltages: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarms: Option<CellAlarms>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<f64>>::deserialize(deserializer)?.unwrap_or_default())
}

impl BmsTelemetry {
    /// Summary statistics over the reported cell voltages
    pub fn cell_stats(&self) -> Option<CellStats> {
        CellStats::from_voltages(&self.cell_voltages)
    }

    /// Whether any alarm flag is raised
    pub fn has_active_alarm(&self) -> bool {
        self.alarms.as_ref().is_some_and(CellAlarms::any_active)
    }
}

/// Protection alarm flags reported alongside telemetry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellAlarms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overvoltage: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undervoltage: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overcurrent_charge: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overcurrent_discharge: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overtemperature: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undertemperature: Option<bool>,
}

impl CellAlarms {
    /// Names of the alarms currently raised, in a fixed order
    pub fn active(&self) -> Vec<&'static str> {
        [
            ("overvoltage", self.overvoltage),
            ("undervoltage", self.undervoltage),
            ("overcurrent_charge", self.overcurrent_charge),
            ("overcurrent_discharge", self.overcurrent_discharge),
            ("overtemperature", self.overtemperature),
            ("undertemperature", self.undertemperature),
        ]
        .into_iter()
        .filter_map(|(name, flag)| (flag == Some(true)).then_some(name))
        .collect()
    }

    pub fn any_active(&self) -> bool {
        !self.active().is_empty()
    }
}

/// Cell balance figures derived from one telemetry record
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellStats {
    /// Highest cell voltage in millivolts
    pub max_mv: f64,
    /// Lowest non-zero cell voltage in millivolts
    pub min_mv: f64,
    /// `max_mv - min_mv`
    pub delta_mv: f64,
    /// 100 when perfectly balanced, 0 at a spread of [`CellStats::FULL_SCALE_DELTA_MV`] or more
    pub balance_pct: f64,
}

impl CellStats {
    /// Spread at which the balance score bottoms out
    pub const FULL_SCALE_DELTA_MV: f64 = 200.0;

    /// Zero readings mark absent cells and are excluded from the minimum.
    pub fn from_voltages(voltages: &[f64]) -> Option<Self> {
        let present: Vec<f64> = voltages.iter().copied().filter(|v| *v > 0.0).collect();
        if present.is_empty() {
            return None;
        }

        let max_mv = present.iter().copied().fold(f64::MIN, f64::max);
        let min_mv = present.iter().copied().fold(f64::MAX, f64::min);
        let delta_mv = max_mv - min_mv;
        let balance_pct = (100.0 - (delta_mv / Self::FULL_SCALE_DELTA_MV) * 100.0).max(0.0);

        Some(Self {
            max_mv,
            min_mv,
            delta_mv,
            balance_pct,
        })
    }
}

/// Device and network health published on the `status` topic
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bms_connected: Option<bool>,
    /// Wi-Fi signal strength in dBm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<f64>,
    /// Free heap on the gateway in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_heap: Option<f64>,
    /// Gateway uptime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_pub_count: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_fail_count: Option<f64>,
}

/// Control message published on the `control` topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub value: bool,
    /// Epoch milliseconds at which the request was built
    pub timestamp: i64,
}

impl CommandRequest {
    /// Build a request; an omitted value means "enable" / "do it"
    pub fn new(command: impl Into<String>, value: Option<bool>, timestamp: i64) -> Self {
        Self {
            command: command.into(),
            value: value.unwrap_or(true),
            timestamp,
        }
    }

    /// Build a request stamped with the current wall-clock time
    pub fn now(command: impl Into<String>, value: Option<bool>) -> Self {
        Self::new(command, value, chrono::Utc::now().timestamp_millis())
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Commands understood by the BMS firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BmsCommand {
    /// Open or close the charge MOSFET
    ChargeEnable,
    /// Open or close the discharge MOSFET
    DischargeEnable,
    /// Restart the BMS controller
    ResetBms,
}

impl BmsCommand {
    pub const ALL: [BmsCommand; 3] = [
        BmsCommand::ChargeEnable,
        BmsCommand::DischargeEnable,
        BmsCommand::ResetBms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BmsCommand::ChargeEnable => "charge_enable",
            BmsCommand::DischargeEnable => "discharge_enable",
            BmsCommand::ResetBms => "reset_bms",
        }
    }
}

impl fmt::Display for BmsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BmsCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| format!("Unknown BMS command: {s}"))
    }
}
