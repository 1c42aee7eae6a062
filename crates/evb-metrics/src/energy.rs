//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use evb_core::{Budget, CycleOutcome, Reporter, Temperature};
use prometheus::{GaugeVec, IntCounterVec, IntGauge, Opts};

use crate::SharedRegistry;

const ENERGY_NAMESPACE: &str = "energy";
const EVSE_NAMESPACE: &str = "evse";

/// Site energy and EVSE gauges fed by the pollers and the decision loop.
#[derive(Clone, Debug)]
pub struct EnergyMetrics {
    registry: SharedRegistry,
    instant_power: GaugeVec,
    energy_exported: GaugeVec,
    energy_imported: GaugeVec,
    battery_level: GaugeVec,
    energy_levels: GaugeVec,
    grid_services_active: GaugeVec,
    evse_current: GaugeVec,
    evse_temperature: GaugeVec,
    evse_vehicle: GaugeVec,
    budget_watts: IntGauge,
    decision_cycles: IntCounterVec,
}

fn gauge_vec(
    registry: &SharedRegistry,
    namespace: &str,
    name: &str,
    help: &str,
    label: &str,
) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help).namespace(namespace), &[label])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl EnergyMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let instant_power = gauge_vec(
            &registry,
            ENERGY_NAMESPACE,
            "instantaneous_power",
            "Instantaneous power of individual meters (W)",
            "meter",
        )?;
        let energy_exported = gauge_vec(
            &registry,
            ENERGY_NAMESPACE,
            "energy_exported",
            "Total energy exported from individual meters (Wh)",
            "meter",
        )?;
        let energy_imported = gauge_vec(
            &registry,
            ENERGY_NAMESPACE,
            "energy_imported",
            "Total energy imported from individual meters (Wh)",
            "meter",
        )?;
        let battery_level = gauge_vec(
            &registry,
            ENERGY_NAMESPACE,
            "battery_percentage",
            "Battery level percentage (0-100)",
            "battery",
        )?;
        let energy_levels = gauge_vec(
            &registry,
            ENERGY_NAMESPACE,
            "energy_levels",
            "Nominal battery pack energy levels (Wh)",
            "level",
        )?;
        let grid_services_active = gauge_vec(
            &registry,
            ENERGY_NAMESPACE,
            "grid_services_active",
            "Indicator (0/1) whether a grid services event is active",
            "source",
        )?;
        let evse_current = gauge_vec(
            &registry,
            EVSE_NAMESPACE,
            "current_amps",
            "Charging current drawn through the EVSE (A)",
            "evse",
        )?;
        let evse_temperature = gauge_vec(
            &registry,
            EVSE_NAMESPACE,
            "temperature_celsius",
            "EVSE internal temperature (C)",
            "evse",
        )?;
        let evse_vehicle = gauge_vec(
            &registry,
            EVSE_NAMESPACE,
            "vehicle_connected",
            "Indicator (0/1) whether a vehicle is plugged in",
            "evse",
        )?;

        let budget_watts = IntGauge::with_opts(Opts::new(
            "evbd_budget_watts",
            "Most recently dispatched charging budget (W)",
        ))?;
        registry.register(Box::new(budget_watts.clone()))?;

        let decision_cycles = IntCounterVec::new(
            Opts::new(
                "evbd_decision_cycles_total",
                "Decision cycles by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(decision_cycles.clone()))?;

        Ok(Self {
            registry,
            instant_power,
            energy_exported,
            energy_imported,
            battery_level,
            energy_levels,
            grid_services_active,
            evse_current,
            evse_temperature,
            evse_vehicle,
            budget_watts,
            decision_cycles,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_meter(&self, meter: &str, instant_power_w: f64, exported_wh: f64, imported_wh: f64) {
        self.instant_power
            .with_label_values(&[meter])
            .set(instant_power_w);
        self.energy_exported
            .with_label_values(&[meter])
            .set(exported_wh);
        self.energy_imported
            .with_label_values(&[meter])
            .set(imported_wh);
    }

    pub fn set_power(&self, meter: &str, watts: f64) {
        self.instant_power.with_label_values(&[meter]).set(watts);
    }

    pub fn set_energy_imported(&self, meter: &str, watt_hours: f64) {
        self.energy_imported
            .with_label_values(&[meter])
            .set(watt_hours);
    }

    pub fn set_battery_level(&self, battery: &str, percent: f64) {
        self.battery_level.with_label_values(&[battery]).set(percent);
    }

    pub fn set_energy_level(&self, level: &str, watt_hours: f64) {
        self.energy_levels
            .with_label_values(&[level])
            .set(watt_hours);
    }

    pub fn set_grid_services_active(&self, source: &str, active: bool) {
        self.grid_services_active
            .with_label_values(&[source])
            .set(if active { 1.0 } else { 0.0 });
    }

    pub fn set_evse_current(&self, evse: &str, milliamps: i64) {
        self.evse_current
            .with_label_values(&[evse])
            .set(milliamps as f64 / 1000.0);
    }

    pub fn set_evse_temperature(&self, evse: &str, temperature: Temperature) {
        self.evse_temperature
            .with_label_values(&[evse])
            .set(temperature.as_celsius());
    }

    pub fn set_vehicle_connected(&self, evse: &str, connected: bool) {
        self.evse_vehicle
            .with_label_values(&[evse])
            .set(if connected { 1.0 } else { 0.0 });
    }

    pub fn set_budget(&self, watts: i64) {
        self.budget_watts.set(watts);
    }

    pub fn record_cycle(&self, outcome: CycleOutcome) {
        self.decision_cycles
            .with_label_values(&[outcome.as_str()])
            .inc();
    }
}

/// Mirrors controller telemetry into [`EnergyMetrics`].
#[derive(Clone, Debug)]
pub struct MetricsReporter {
    metrics: EnergyMetrics,
    evse: String,
}

impl MetricsReporter {
    pub fn new(metrics: EnergyMetrics, evse: impl Into<String>) -> Self {
        Self {
            metrics,
            evse: evse.into(),
        }
    }
}

impl Reporter for MetricsReporter {
    fn report_budget(&self, budget: &Budget) {
        self.metrics.set_budget(budget.watts);
    }

    fn report_ev_connected(&self, connected: bool) {
        self.metrics.set_vehicle_connected(&self.evse, connected);
    }

    fn report_evse_current(&self, milliamps: i64) {
        self.metrics.set_evse_current(&self.evse, milliamps);
    }

    fn report_evse_temperature(&self, temperature: Temperature) {
        self.metrics.set_evse_temperature(&self.evse, temperature);
    }

    fn report_cycle(&self, outcome: CycleOutcome) {
        self.metrics.record_cycle(outcome);
    }
}
