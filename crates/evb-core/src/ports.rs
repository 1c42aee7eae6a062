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
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveTime};
use parking_lot::Mutex;

use crate::error::DispatchError;
use crate::rules::{Budget, ChargeMode};
use crate::sensors::Temperature;

/// Applies a clamped budget. The only irreversible action the engine takes.
#[async_trait]
pub trait BudgetSink: Send + Sync + 'static {
    async fn apply(&self, budget: &Budget) -> Result<(), DispatchError>;
}

/// Switches the charger between fast and eco mode ahead of a budget publish.
#[async_trait]
pub trait ChargeModeSetter: Send + Sync + 'static {
    async fn set_charge_mode(&self, mode: ChargeMode) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleOutcome {
    Dispatched,
    InsufficientData,
    DispatchFailed,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleOutcome::Dispatched => "dispatched",
            CycleOutcome::InsufficientData => "insufficient_data",
            CycleOutcome::DispatchFailed => "dispatch_failed",
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-way telemetry. Implementations must not block.
pub trait Reporter: Send + Sync + 'static {
    fn report_budget(&self, budget: &Budget);
    fn report_ev_connected(&self, connected: bool);
    fn report_evse_current(&self, milliamps: i64);
    fn report_evse_temperature(&self, temperature: Temperature);
    fn report_cycle(&self, _outcome: CycleOutcome) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report_budget(&self, _: &Budget) {}
    fn report_ev_connected(&self, _: bool) {}
    fn report_evse_current(&self, _: i64) {}
    fn report_evse_temperature(&self, _: Temperature) {}
}

/// Forwards every report to each inner reporter in order.
#[derive(Clone, Default)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for FanoutReporter {
    fn report_budget(&self, budget: &Budget) {
        for reporter in &self.reporters {
            reporter.report_budget(budget);
        }
    }

    fn report_ev_connected(&self, connected: bool) {
        for reporter in &self.reporters {
            reporter.report_ev_connected(connected);
        }
    }

    fn report_evse_current(&self, milliamps: i64) {
        for reporter in &self.reporters {
            reporter.report_evse_current(milliamps);
        }
    }

    fn report_evse_temperature(&self, temperature: Temperature) {
        for reporter in &self.reporters {
            reporter.report_evse_temperature(temperature);
        }
    }

    fn report_cycle(&self, outcome: CycleOutcome) {
        for reporter in &self.reporters {
            reporter.report_cycle(outcome);
        }
    }
}

/// Local wall-clock source for the time-windowed rules.
pub trait Clock: Send + Sync + 'static {
    fn local_time(&self) -> NaiveTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_time(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    time: Mutex<NaiveTime>,
}

impl FixedClock {
    pub fn new(time: NaiveTime) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    pub fn set(&self, time: NaiveTime) {
        *self.time.lock() = time;
    }
}

impl Clock for FixedClock {
    fn local_time(&self) -> NaiveTime {
        *self.time.lock()
    }
}
