//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;
use crate::time::MinuteWindow;

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_broker() -> String {
    "tcp://127.0.0.1:1883".to_owned()
}

fn default_client_id() -> String {
    "evbd".to_owned()
}

fn default_base_topic() -> String {
    "powerwall2mqtt".to_owned()
}

fn default_budget_topic() -> String {
    "powerwall/excess_power".to_owned()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_volts() -> u32 {
    240
}

fn default_max_amps() -> u32 {
    40
}

fn default_min_amps() -> u32 {
    8
}

fn default_battery_export_threshold_w() -> f64 {
    200.0
}

fn default_ev_urgent_percent() -> f64 {
    60.0
}

fn default_overnight_window() -> MinuteWindow {
    MinuteWindow::from_minutes_unchecked(0, 6 * 60)
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9900))
}

/// Primary configuration object for the governor daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub openevse: OpenEvseConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub charging: ChargingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "EVB_CONFIG";

    /// Load configuration from disk, respecting the `EVB_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.charging.validate()?;
        self.mqtt.validate()?;
        if self.polling.interval.is_zero() {
            return Err(anyhow!("polling.interval must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Powerwall gateway endpoint. Reads are expected to succeed without a login.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_http_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default)]
    pub debug_payloads: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: None,
            accept_invalid_certs: true,
            timeout: default_http_timeout(),
            debug_payloads: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenEvseConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_http_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    /// Switch the EVSE between `fast` and `eco` before publishing each budget.
    #[serde(default)]
    pub manage_charge_mode: bool,
}

impl Default for OpenEvseConfig {
    fn default() -> Self {
        Self {
            address: None,
            timeout: default_http_timeout(),
            manage_charge_mode: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_budget_topic")]
    pub budget_topic: String,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub home_assistant_discovery: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            client_id: default_client_id(),
            base_topic: default_base_topic(),
            budget_topic: default_budget_topic(),
            keep_alive: default_keep_alive(),
            username: None,
            password: None,
            home_assistant_discovery: true,
        }
    }
}

impl MqttConfig {
    /// Resolve `tcp://host:port` into the host and port rumqttc expects.
    pub fn broker_endpoint(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.broker)
            .with_context(|| format!("invalid mqtt broker url '{}'", self.broker))?;
        if !matches!(url.scheme(), "tcp" | "mqtt") {
            return Err(anyhow!(
                "unsupported mqtt broker scheme '{}' (expected tcp or mqtt)",
                url.scheme()
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("mqtt broker url '{}' has no host", self.broker))?;
        Ok((host.to_owned(), url.port().unwrap_or(1883)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_topic.trim().is_empty() {
            return Err(anyhow!("mqtt.base_topic must not be empty"));
        }
        if self.budget_topic.trim().is_empty() {
            return Err(anyhow!("mqtt.budget_topic must not be empty"));
        }
        self.broker_endpoint()?;
        Ok(())
    }
}

/// One step of the temperature derate table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerateStep {
    pub above_celsius: f64,
    pub max_amps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerateConfig {
    Table { steps: Vec<DerateStep> },
    Cutoff { above_celsius: f64 },
}

impl Default for DerateConfig {
    fn default() -> Self {
        DerateConfig::Table {
            steps: vec![
                DerateStep { above_celsius: 50.0, max_amps: 8 },
                DerateStep { above_celsius: 49.0, max_amps: 12 },
                DerateStep { above_celsius: 48.0, max_amps: 16 },
                DerateStep { above_celsius: 47.0, max_amps: 24 },
                DerateStep { above_celsius: 46.0, max_amps: 32 },
            ],
        }
    }
}

/// Charging policy inputs consumed by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingConfig {
    #[serde(default = "default_volts")]
    pub volts: u32,
    #[serde(default = "default_max_amps")]
    pub max_amps: u32,
    #[serde(default = "default_min_amps")]
    pub min_amps: u32,
    #[serde(default = "default_battery_export_threshold_w")]
    pub battery_export_threshold_w: f64,
    #[serde(default = "default_ev_urgent_percent")]
    pub ev_urgent_below_percent: f64,
    #[serde(default = "default_ev_urgent_percent")]
    pub ev_urgent_release_percent: f64,
    #[serde(default)]
    pub derate: DerateConfig,
    #[serde(default = "default_overnight_window")]
    pub overnight_window: MinuteWindow,
    #[serde(default)]
    pub peak_window: Option<MinuteWindow>,
    /// Strategy applied at startup before any operator command arrives.
    #[serde(default)]
    pub initial_strategy: Option<String>,
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            volts: default_volts(),
            max_amps: default_max_amps(),
            min_amps: default_min_amps(),
            battery_export_threshold_w: default_battery_export_threshold_w(),
            ev_urgent_below_percent: default_ev_urgent_percent(),
            ev_urgent_release_percent: default_ev_urgent_percent(),
            derate: DerateConfig::default(),
            overnight_window: default_overnight_window(),
            peak_window: None,
            initial_strategy: None,
        }
    }
}

impl ChargingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.volts == 0 {
            return Err(anyhow!("charging.volts must be greater than zero"));
        }
        if self.max_amps == 0 {
            return Err(anyhow!("charging.max_amps must be greater than zero"));
        }
        if self.min_amps > self.max_amps {
            return Err(anyhow!(
                "charging.min_amps ({}) exceeds charging.max_amps ({})",
                self.min_amps,
                self.max_amps
            ));
        }
        for (name, value) in [
            ("ev_urgent_below_percent", self.ev_urgent_below_percent),
            ("ev_urgent_release_percent", self.ev_urgent_release_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(anyhow!("charging.{} must be within 0..=100", name));
            }
        }
        if self.ev_urgent_release_percent < self.ev_urgent_below_percent {
            return Err(anyhow!(
                "charging.ev_urgent_release_percent must not be below ev_urgent_below_percent"
            ));
        }
        if let DerateConfig::Table { steps } = &self.derate {
            if steps.is_empty() {
                return Err(anyhow!("charging.derate table must contain at least one step"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rolling JSON log files. Stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
        }
    }
}
