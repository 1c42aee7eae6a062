//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Powerwall gateway client.
//!
//! The client expects an endpoint that already accepts unauthenticated reads,
//! such as a local gateway proxy.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use evb_common::config::GatewayConfig;
use evb_core::{Controller, OperationMode};
use evb_metrics::EnergyMetrics;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{GatewayError, GatewayResult};
use crate::poller::Poller;
use crate::{base_url, endpoint};

pub const METERS_PATH: &str = "/api/meters/aggregates";
pub const SOE_PATH: &str = "/api/system_status/soe";
pub const SYSTEM_STATUS_PATH: &str = "/api/system_status";
pub const GRID_STATUS_PATH: &str = "/api/system_status/grid_status";
pub const OPERATION_PATH: &str = "/api/operation";

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct MeterReading {
    /// Absent when the gateway omits it; never read as zero.
    pub instant_power: Option<f64>,
    #[serde(default)]
    pub energy_exported: f64,
    #[serde(default)]
    pub energy_imported: f64,
}

/// Meter readings keyed by meter name (`site`, `battery`, `load`, `solar`, ...).
pub type MeterAggregates = BTreeMap<String, MeterReading>;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct StateOfEnergy {
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SystemStatus {
    #[serde(default)]
    pub nominal_full_pack_energy: f64,
    #[serde(default)]
    pub nominal_energy_remaining: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GridStatus {
    pub grid_services_active: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub backup_reserve_percent: f64,
    pub real_mode: String,
}

impl Operation {
    pub fn mode(&self) -> OperationMode {
        OperationMode::from_real_mode(&self.real_mode)
    }
}

/// Controller inputs derived from one meter aggregate sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SiteReadings {
    /// Power flowing out to the grid. The site meter reports imports as positive.
    pub exported_solar_w: Option<f64>,
    pub exported_battery_w: Option<f64>,
    pub load_w: Option<f64>,
    pub solar_w: Option<f64>,
}

impl SiteReadings {
    pub fn from_meters(meters: &MeterAggregates) -> Self {
        let power = |name: &str| meters.get(name).and_then(|meter| meter.instant_power);
        Self {
            exported_solar_w: power("site").map(|watts| -watts),
            exported_battery_w: power("battery"),
            load_w: power("load"),
            solar_w: power("solar"),
        }
    }
}

/// Forward readings to the controller. Missing meters are skipped.
pub fn apply_site_readings(controller: &Controller, readings: &SiteReadings) {
    if let Some(watts) = readings.exported_solar_w {
        controller.set_exported_solar_w(watts);
    }
    if let Some(watts) = readings.exported_battery_w {
        controller.set_exported_battery_w(watts);
    }
    if let Some(watts) = readings.load_w {
        controller.set_load_w(watts);
    }
    if let Some(watts) = readings.solar_w {
        controller.set_solar_w(watts);
    }
}

#[derive(Debug, Clone)]
pub struct PowerwallClient {
    http: reqwest::Client,
    base: Url,
    debug_payloads: bool,
}

impl PowerwallClient {
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let address = config
            .address
            .as_deref()
            .ok_or_else(|| GatewayError::Config("gateway.address is not set".into()))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .cookie_store(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|err| GatewayError::Config(err.to_string()))?;
        Ok(Self {
            http,
            base: base_url(address, "https")?,
            debug_payloads: config.debug_payloads,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> GatewayResult<T> {
        let url = endpoint(&self.base, path)?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status {
                endpoint: path.to_owned(),
                status,
            });
        }
        let body = response.text().await?;
        if self.debug_payloads {
            debug!(endpoint = path, body = %body, "gateway payload");
        }
        serde_json::from_str(&body).map_err(|source| GatewayError::Decode {
            endpoint: path.to_owned(),
            source,
        })
    }

    pub async fn meter_aggregates(&self) -> GatewayResult<MeterAggregates> {
        self.get_json(METERS_PATH).await
    }

    pub async fn state_of_energy(&self) -> GatewayResult<StateOfEnergy> {
        self.get_json(SOE_PATH).await
    }

    pub async fn system_status(&self) -> GatewayResult<SystemStatus> {
        self.get_json(SYSTEM_STATUS_PATH).await
    }

    pub async fn grid_status(&self) -> GatewayResult<GridStatus> {
        self.get_json(GRID_STATUS_PATH).await
    }

    pub async fn operation(&self) -> GatewayResult<Operation> {
        self.get_json(OPERATION_PATH).await
    }
}

/// Polls every gateway endpoint and forwards what succeeded.
pub struct PowerwallPoller {
    client: PowerwallClient,
    controller: Arc<Controller>,
    metrics: Option<EnergyMetrics>,
}

impl PowerwallPoller {
    pub fn new(
        client: PowerwallClient,
        controller: Arc<Controller>,
        metrics: Option<EnergyMetrics>,
    ) -> Self {
        Self {
            client,
            controller,
            metrics,
        }
    }

    fn record_meters(&self, meters: &MeterAggregates) {
        if let Some(metrics) = &self.metrics {
            for (name, meter) in meters {
                let Some(instant_power) = meter.instant_power else {
                    continue;
                };
                metrics.set_meter(name, instant_power, meter.energy_exported, meter.energy_imported);
            }
        }
    }
}

#[async_trait]
impl Poller for PowerwallPoller {
    fn name(&self) -> &'static str {
        "powerwall"
    }

    async fn poll_once(&self) -> GatewayResult<()> {
        let mut first_error: Option<GatewayError> = None;
        let mut note = |endpoint: &str, err: GatewayError| {
            warn!(endpoint, error = %err, "gateway read failed");
            first_error.get_or_insert(err);
        };

        match self.client.meter_aggregates().await {
            Ok(meters) => {
                self.record_meters(&meters);
                apply_site_readings(&self.controller, &SiteReadings::from_meters(&meters));
            }
            Err(err) => note(METERS_PATH, err),
        }

        match self.client.state_of_energy().await {
            Ok(soe) => {
                if let Some(metrics) = &self.metrics {
                    metrics.set_battery_level("powerwall", soe.percentage);
                }
                self.controller
                    .set_powerwall_battery_level_percent(soe.percentage);
            }
            Err(err) => note(SOE_PATH, err),
        }

        match self.client.system_status().await {
            Ok(status) => {
                if let Some(metrics) = &self.metrics {
                    metrics.set_energy_level("nominal_full_pack", status.nominal_full_pack_energy);
                    metrics.set_energy_level(
                        "nominal_energy_remaining",
                        status.nominal_energy_remaining,
                    );
                }
            }
            Err(err) => note(SYSTEM_STATUS_PATH, err),
        }

        match self.client.grid_status().await {
            Ok(grid) => {
                if let Some(metrics) = &self.metrics {
                    metrics.set_grid_services_active("powerwall", grid.grid_services_active);
                }
                self.controller.set_load_reduction(grid.grid_services_active);
            }
            Err(err) => note(GRID_STATUS_PATH, err),
        }

        match self.client.operation().await {
            Ok(operation) => {
                if let Some(metrics) = &self.metrics {
                    metrics.set_battery_level("powerwall_reserve", operation.backup_reserve_percent);
                }
                self.controller.set_operation_mode(operation.mode());
            }
            Err(err) => note(OPERATION_PATH, err),
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
