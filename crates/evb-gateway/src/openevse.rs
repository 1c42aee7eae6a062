//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use evb_common::config::OpenEvseConfig;
use evb_core::{ChargeMode, ChargeModeSetter, Controller, DispatchError, Temperature};
use evb_metrics::EnergyMetrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{GatewayError, GatewayResult};
use crate::poller::Poller;
use crate::{base_url, endpoint};

const STATUS_PATH: &str = "/status";
const CONFIG_PATH: &str = "/config";
const EVSE_LABEL: &str = "ev";

/// Subset of the OpenEVSE `/status` document.
///
/// Fields that feed the controller stay `None` when the document omits them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct EvseStatus {
    /// Charging current in milliamps.
    #[serde(rename = "amp")]
    pub milliamps: Option<i64>,
    /// Temperature in tenths of a degree Celsius.
    pub temp: Option<i64>,
    #[serde(default)]
    pub pilot: i64,
    #[serde(default)]
    pub voltage: i64,
    #[serde(default)]
    pub watthour: f64,
    #[serde(default)]
    pub wattsec: f64,
    pub vehicle: Option<i64>,
}

impl EvseStatus {
    pub fn temperature(&self) -> Option<Temperature> {
        self.temp.map(Temperature::from_deci_celsius)
    }

    pub fn vehicle_connected(&self) -> Option<bool> {
        self.vehicle.map(|flag| flag == 1)
    }

    pub fn power_w(&self) -> Option<f64> {
        self.milliamps
            .map(|milliamps| (self.voltage * milliamps) as f64 / 1000.0)
    }

    /// Session energy, combining the whole watt-hours and the sub-hour remainder.
    pub fn energy_wh(&self) -> f64 {
        self.watthour + self.wattsec / 3600.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvseConfig {
    #[serde(default)]
    pub charge_mode: String,
}

pub fn apply_evse_status(controller: &Controller, status: &EvseStatus) {
    if let Some(temperature) = status.temperature() {
        controller.set_evse_temperature(temperature);
    }
    if let Some(milliamps) = status.milliamps {
        controller.set_evse_current_ma(milliamps);
    }
    if let Some(connected) = status.vehicle_connected() {
        controller.set_ev_connected(connected);
    }
}

#[derive(Debug, Clone)]
pub struct OpenEvseClient {
    http: reqwest::Client,
    base: Url,
}

impl OpenEvseClient {
    pub fn from_config(config: &OpenEvseConfig) -> GatewayResult<Self> {
        let address = config
            .address
            .as_deref()
            .ok_or_else(|| GatewayError::Config("openevse.address is not set".into()))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| GatewayError::Config(err.to_string()))?;
        Ok(Self {
            http,
            base: base_url(address, "http")?,
        })
    }

    fn check(response: reqwest::Response, path: &str) -> GatewayResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(GatewayError::Status {
                endpoint: path.to_owned(),
                status,
            })
        }
    }

    pub async fn status(&self) -> GatewayResult<EvseStatus> {
        let response = self.http.get(endpoint(&self.base, STATUS_PATH)?).send().await?;
        let status: EvseStatus = Self::check(response, STATUS_PATH)?.json().await?;
        debug!(?status, "openevse status");
        Ok(status)
    }

    pub async fn config(&self) -> GatewayResult<EvseConfig> {
        let response = self.http.get(endpoint(&self.base, CONFIG_PATH)?).send().await?;
        Ok(Self::check(response, CONFIG_PATH)?.json().await?)
    }

    pub async fn set_config(&self, config: &EvseConfig) -> GatewayResult<()> {
        let response = self
            .http
            .post(endpoint(&self.base, CONFIG_PATH)?)
            .json(config)
            .send()
            .await?;
        Self::check(response, CONFIG_PATH)?;
        Ok(())
    }
}

#[async_trait]
impl ChargeModeSetter for OpenEvseClient {
    async fn set_charge_mode(&self, mode: ChargeMode) -> Result<(), DispatchError> {
        let config = EvseConfig {
            charge_mode: mode.as_str().to_owned(),
        };
        self.set_config(&config)
            .await
            .map_err(|err| DispatchError::ChargeMode {
                mode,
                reason: err.to_string(),
            })?;
        info!(mode = %mode, "openevse charge mode set");
        Ok(())
    }
}

pub struct OpenEvsePoller {
    client: OpenEvseClient,
    controller: Arc<Controller>,
    metrics: Option<EnergyMetrics>,
}

impl OpenEvsePoller {
    pub fn new(
        client: OpenEvseClient,
        controller: Arc<Controller>,
        metrics: Option<EnergyMetrics>,
    ) -> Self {
        Self {
            client,
            controller,
            metrics,
        }
    }
}

#[async_trait]
impl Poller for OpenEvsePoller {
    fn name(&self) -> &'static str {
        "openevse"
    }

    async fn poll_once(&self) -> GatewayResult<()> {
        let status = self.client.status().await?;
        if let Some(metrics) = &self.metrics {
            if let Some(watts) = status.power_w() {
                metrics.set_power(EVSE_LABEL, watts);
            }
            metrics.set_energy_imported(EVSE_LABEL, status.energy_wh());
        }
        apply_evse_status(&self.controller, &status);
        Ok(())
    }
}
