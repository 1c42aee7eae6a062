//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge budget decision engine and its collaborator ports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use evb_common::config::{ChargingConfig, DerateConfig};
use evb_common::time::MinuteWindow;

use crate::error::ControllerError;
use crate::sensors::Temperature;

/// Hardware safety derate applied to the charging ceiling.
#[derive(Debug, Clone, PartialEq)]
pub enum Derate {
    /// `(threshold, max_amps)` pairs ordered hottest first. The first
    /// threshold strictly exceeded limits the current.
    Table(Vec<(Temperature, i64)>),
    /// Above the cutoff the charger drops to the minimum current.
    Cutoff(Temperature),
}

impl Derate {
    pub fn from_config(config: &DerateConfig) -> Self {
        match config {
            DerateConfig::Table { steps } => {
                let mut table: Vec<(Temperature, i64)> = steps
                    .iter()
                    .map(|step| {
                        (
                            Temperature::from_celsius(step.above_celsius),
                            i64::from(step.max_amps),
                        )
                    })
                    .collect();
                table.sort_by(|a, b| b.0.cmp(&a.0));
                Derate::Table(table)
            }
            DerateConfig::Cutoff { above_celsius } => {
                Derate::Cutoff(Temperature::from_celsius(*above_celsius))
            }
        }
    }

    /// Amps allowed at `temp`, or `None` when no derate applies.
    pub fn max_amps(&self, temp: Temperature, min_amps: i64) -> Option<i64> {
        match self {
            Derate::Table(table) => table
                .iter()
                .find(|(threshold, _)| temp > *threshold)
                .map(|(_, amps)| *amps),
            Derate::Cutoff(cutoff) => (temp > *cutoff).then_some(min_amps),
        }
    }
}

/// Hysteresis band for the low EV battery rule.
///
/// Urgency latches on when the level drops below `enter_below` and stays on
/// until the level reaches `release_at`. Equal bounds degrade to a plain
/// `level < enter_below` check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UrgencyBand {
    enter_below: f64,
    release_at: f64,
}

impl UrgencyBand {
    pub fn new(enter_below: f64, release_at: f64) -> Result<Self, ControllerError> {
        if release_at < enter_below {
            return Err(ControllerError::InvalidPolicy(format!(
                "ev urgency release ({}) must not be below its entry threshold ({})",
                release_at, enter_below
            )));
        }
        Ok(Self {
            enter_below,
            release_at,
        })
    }

    pub fn enter_below(&self) -> f64 {
        self.enter_below
    }

    pub fn release_at(&self) -> f64 {
        self.release_at
    }

    pub fn next(&self, latched: bool, level: f64) -> bool {
        if latched {
            level < self.release_at
        } else {
            level < self.enter_below
        }
    }
}

impl Default for UrgencyBand {
    fn default() -> Self {
        Self {
            enter_below: 60.0,
            release_at: 60.0,
        }
    }
}

/// Static inputs to the rule ladder, supplied at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargePolicy {
    volts: i64,
    max_amps: i64,
    min_amps: i64,
    derate: Derate,
    battery_export_threshold_w: f64,
    ev_urgency: UrgencyBand,
    overnight_window: MinuteWindow,
    peak_window: Option<MinuteWindow>,
}

impl ChargePolicy {
    pub fn from_config(config: &ChargingConfig) -> Result<Self, ControllerError> {
        config
            .validate()
            .map_err(|err| ControllerError::InvalidPolicy(err.to_string()))?;
        Ok(Self {
            volts: i64::from(config.volts),
            max_amps: i64::from(config.max_amps),
            min_amps: i64::from(config.min_amps),
            derate: Derate::from_config(&config.derate),
            battery_export_threshold_w: config.battery_export_threshold_w,
            ev_urgency: UrgencyBand::new(
                config.ev_urgent_below_percent,
                config.ev_urgent_release_percent,
            )?,
            overnight_window: config.overnight_window,
            peak_window: config.peak_window,
        })
    }

    pub fn with_derate(mut self, derate: Derate) -> Self {
        self.derate = derate;
        self
    }

    pub fn with_ev_urgency(mut self, band: UrgencyBand) -> Self {
        self.ev_urgency = band;
        self
    }

    pub fn with_peak_window(mut self, window: Option<MinuteWindow>) -> Self {
        self.peak_window = window;
        self
    }

    pub fn with_overnight_window(mut self, window: MinuteWindow) -> Self {
        self.overnight_window = window;
        self
    }

    pub fn volts(&self) -> i64 {
        self.volts
    }

    pub fn max_amps(&self) -> i64 {
        self.max_amps
    }

    pub fn min_amps(&self) -> i64 {
        self.min_amps
    }

    pub fn derate(&self) -> &Derate {
        &self.derate
    }

    pub fn battery_export_threshold_w(&self) -> f64 {
        self.battery_export_threshold_w
    }

    pub fn ev_urgency(&self) -> UrgencyBand {
        self.ev_urgency
    }

    pub fn overnight_window(&self) -> MinuteWindow {
        self.overnight_window
    }

    pub fn peak_window(&self) -> Option<MinuteWindow> {
        self.peak_window
    }

    pub(crate) fn set_peak_window(&mut self, window: Option<MinuteWindow>) {
        self.peak_window = window;
    }

    /// Hardware limit `volts × max_amps`.
    pub fn max_power_w(&self) -> i64 {
        self.volts * self.max_amps
    }

    /// Derated ceiling before the economic rules. `i64::MAX` when no derate applies.
    pub fn ceiling(&self, temperature: Option<Temperature>) -> i64 {
        temperature
            .and_then(|temp| self.derate.max_amps(temp, self.min_amps))
            .map(|amps| self.volts * amps)
            .unwrap_or(i64::MAX)
    }

    pub fn clamp(&self, watts: i64) -> i64 {
        watts.clamp(0, self.max_power_w())
    }
}

impl Default for ChargePolicy {
    fn default() -> Self {
        let config = ChargingConfig::default();
        Self {
            volts: i64::from(config.volts),
            max_amps: i64::from(config.max_amps),
            min_amps: i64::from(config.min_amps),
            derate: Derate::from_config(&config.derate),
            battery_export_threshold_w: config.battery_export_threshold_w,
            ev_urgency: UrgencyBand::default(),
            overnight_window: config.overnight_window,
            peak_window: config.peak_window,
        }
    }
}
