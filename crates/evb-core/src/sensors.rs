//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge budget decision engine and its collaborator ports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// EVSE temperature in tenths of a degree Celsius.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Temperature(i64);

impl Temperature {
    pub const fn from_deci_celsius(deci: i64) -> Self {
        Self(deci)
    }

    /// Rounds to the nearest tenth of a degree.
    pub fn from_celsius(celsius: f64) -> Self {
        Self((celsius * 10.0).round() as i64)
    }

    pub const fn deci_celsius(self) -> i64 {
        self.0
    }

    pub fn as_celsius(self) -> f64 {
        self.0 as f64 / 10.0
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{} C", sign, abs / 10, abs % 10)
    }
}

/// Powerwall operation mode as reported by the gateway's `real_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    SelfConsumption,
    Autonomous,
    Backup,
    Unknown,
}

impl OperationMode {
    pub fn from_real_mode(raw: &str) -> Self {
        match raw.trim() {
            "self_consumption" => OperationMode::SelfConsumption,
            "autonomous" => OperationMode::Autonomous,
            "backup" => OperationMode::Backup,
            _ => OperationMode::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::SelfConsumption => "self_consumption",
            OperationMode::Autonomous => "autonomous",
            OperationMode::Backup => "backup",
            OperationMode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-selected charging strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Follow solar export and the economic rules.
    Auto,
    /// Charge at the derated ceiling regardless of economics.
    FullSpeed,
    /// Charge at the ceiling inside the overnight window.
    Overnight,
    /// Stop inside the utility peak window, charge at the ceiling outside it.
    OffPeak,
    Unknown,
}

impl Strategy {
    /// Parse an operator command. Unrecognised input maps to [`Strategy::Unknown`].
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Strategy::Auto,
            "full_speed" | "full-speed" => Strategy::FullSpeed,
            "overnight" => Strategy::Overnight,
            "off_peak" | "off-peak" => Strategy::OffPeak,
            _ => Strategy::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Auto => "auto",
            Strategy::FullSpeed => "full_speed",
            Strategy::Overnight => "overnight",
            Strategy::OffPeak => "off_peak",
            Strategy::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest reading of every sensor. `None` means the reading has never arrived
/// since process start and must not be trusted by the rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub exported_solar_w: Option<f64>,
    pub exported_battery_w: Option<f64>,
    pub solar_w: Option<f64>,
    pub load_w: Option<f64>,
    pub powerwall_battery_percent: Option<f64>,
    pub ev_battery_percent: Option<f64>,
    pub operation_mode: Option<OperationMode>,
    pub evse_temperature: Option<Temperature>,
    pub evse_current_ma: Option<i64>,
    pub ev_connected: Option<bool>,
    pub load_reduction: Option<bool>,
    pub strategy: Option<Strategy>,
}
